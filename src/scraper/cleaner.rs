use url::Url;

/// Placeholder for a field the page did not provide.
pub const MISSING: &str = "N/A";

/// Collapse runs of whitespace and trim. "  3 + 1\n " → "3 + 1"
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve a possibly relative href against the page it was found on.
pub fn absolute_url(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    base.join(href).ok().map(|mut u| {
        u.set_fragment(None);
        u.to_string()
    })
}

/// Substitute `{page}` and `{offset}` in a page URL template.
pub fn expand_page_template(template: &str, page: u32, page_size: u32) -> String {
    let offset = u64::from(page.saturating_sub(1)) * u64::from(page_size);
    template
        .replace("{page}", &page.to_string())
        .replace("{offset}", &offset.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  3 + 1\n\t "), "3 + 1");
        assert_eq!(clean_text("1.250.000\u{a0}TL"), "1.250.000 TL");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn test_absolute_url() {
        let base = Url::parse("https://example.com/listings?page=3").unwrap();
        assert_eq!(
            absolute_url(&base, "/ilan/123-detail#photos").as_deref(),
            Some("https://example.com/ilan/123-detail")
        );
        assert_eq!(
            absolute_url(&base, "https://other.org/x").as_deref(),
            Some("https://other.org/x")
        );
        assert_eq!(absolute_url(&base, "#top"), None);
        assert_eq!(absolute_url(&base, "  "), None);
    }

    #[test]
    fn test_expand_page_template() {
        let t = "https://example.com/listings?offset={offset}&page={page}";
        assert_eq!(
            expand_page_template(t, 51, 20),
            "https://example.com/listings?offset=1000&page=51"
        );
        assert_eq!(
            expand_page_template(t, 1, 20),
            "https://example.com/listings?offset=0&page=1"
        );
    }
}
