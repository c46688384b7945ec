use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::cleaner::{MISSING, absolute_url, clean_text};
use crate::config::SelectorConfig;
use crate::error::SetupError;
use crate::models::ListingRecord;

/// Compiled form of [`SelectorConfig`].
pub struct ListingSelectors {
    row: Selector,
    link: Selector,
    fields: Vec<(String, Selector)>,
    attributes: Selector,
    attribute_names: Vec<String>,
}

fn compile(css: &str) -> Result<Selector, SetupError> {
    Selector::parse(css).map_err(|e| SetupError::Config(format!("selector {:?}: {:?}", css, e)))
}

impl ListingSelectors {
    pub fn compile(cfg: &SelectorConfig) -> Result<Self, SetupError> {
        let fields = cfg
            .fields
            .iter()
            .map(|(name, css)| Ok((name.clone(), compile(css)?)))
            .collect::<Result<Vec<_>, SetupError>>()?;

        Ok(Self {
            row: compile(&cfg.row)?,
            link: compile(&cfg.link)?,
            fields,
            attributes: compile(&cfg.attributes)?,
            attribute_names: cfg.attribute_names.clone(),
        })
    }
}

/// Extract listing rows from a results page. Rows without a usable link are
/// skipped: without a url a listing cannot be deduplicated.
pub fn parse_listings(
    html: &str,
    selectors: &ListingSelectors,
    base: &Url,
    page: u32,
) -> Vec<ListingRecord> {
    let doc = Html::parse_document(html);
    let mut records = Vec::new();

    for (i, row) in doc.select(&selectors.row).enumerate() {
        let index = i + 1;
        let Some(link) = row.select(&selectors.link).next() else {
            debug!("Page {} row {}: no title link, skipped", page, index);
            continue;
        };
        let Some(url) = link.value().attr("href").and_then(|h| absolute_url(base, h)) else {
            warn!("Page {} row {}: unusable href, skipped", page, index);
            continue;
        };

        let mut record = ListingRecord::new(url)
            .with("index", index.to_string())
            .with("page_number", page.to_string())
            .with("title", text_of(link));

        for (name, sel) in &selectors.fields {
            let value = row
                .select(sel)
                .next()
                .map(text_of)
                .unwrap_or_else(|| MISSING.to_string());
            record.fields.insert(name.clone(), value);
        }

        let cells: Vec<String> = row.select(&selectors.attributes).map(text_of).collect();
        for (pos, name) in selectors.attribute_names.iter().enumerate() {
            let value = cells.get(pos).cloned().unwrap_or_else(|| MISSING.to_string());
            record.fields.insert(name.clone(), value);
        }

        records.push(record);
    }

    records
}

fn text_of(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <table><tbody>
          <tr class="searchResultsItem">
            <td><a class="classifiedTitle" href="/ilan/1001">  Sea view flat </a></td>
            <td class="searchResultsAttributeValue">3+1</td>
            <td class="searchResultsAttributeValue">140 m²</td>
            <td class="searchResultsPriceValue">4.500.000 TL</td>
            <td class="searchResultsDateValue">12 Mart 2024</td>
            <td class="searchResultsLocationValue">Kadıköy</td>
          </tr>
          <tr class="searchResultsItem">
            <td>sponsored block without link</td>
          </tr>
          <tr class="searchResultsItem">
            <td><a class="classifiedTitle" href="https://example.com/ilan/1002">Garden house</a></td>
            <td class="searchResultsPriceValue">9.100.000 TL</td>
          </tr>
        </tbody></table>
    "#;

    #[test]
    fn test_parse_listings_with_default_selectors() {
        let selectors = ListingSelectors::compile(&SelectorConfig::default()).unwrap();
        let base = Url::parse("https://example.com/listings?page=2").unwrap();
        let records = parse_listings(PAGE, &selectors, &base, 2);

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.url, "https://example.com/ilan/1001");
        assert_eq!(first.get("title"), Some("Sea view flat"));
        assert_eq!(first.get("room_count"), Some("3+1"));
        assert_eq!(first.get("area"), Some("140 m²"));
        assert_eq!(first.get("floor"), Some(MISSING));
        assert_eq!(first.get("location"), Some("Kadıköy"));
        assert_eq!(first.get("page_number"), Some("2"));

        let second = &records[1];
        assert_eq!(second.get("index"), Some("3"));
        assert_eq!(second.get("location"), Some(MISSING));
    }

    #[test]
    fn test_bad_selector_is_a_setup_error() {
        let cfg = SelectorConfig {
            row: "tr[".to_string(),
            ..SelectorConfig::default()
        };
        assert!(ListingSelectors::compile(&cfg).is_err());
    }

    #[test]
    fn test_page_without_rows_is_empty() {
        let selectors = ListingSelectors::compile(&SelectorConfig::default()).unwrap();
        let base = Url::parse("https://example.com/").unwrap();
        assert!(parse_listings("<html><body>captcha</body></html>", &selectors, &base, 9).is_empty());
    }
}
