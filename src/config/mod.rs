use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::Batch;

/// Top-level application configuration. Immutable once loaded; every
/// component receives the section it needs at construction.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub rules: ContinuationRules,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default = "default_batches")]
    pub batches: Vec<Batch>,
}

/// Default HTTP listing fetcher
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    /// URL of page 1.
    #[serde(default = "default_first_page_url")]
    pub first_page_url: String,

    /// URL of every later page; `{page}` and `{offset}` are substituted.
    #[serde(default = "default_page_url_template")]
    pub page_url_template: String,

    /// Listings per page, used to compute `{offset}`.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra attempts for a page that failed with a transient error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub selectors: SelectorConfig,
}

/// CSS selectors the fetcher uses to pull listing rows out of a page.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectorConfig {
    #[serde(default = "default_row_selector")]
    pub row: String,

    /// Anchor carrying the title text and the listing href.
    #[serde(default = "default_link_selector")]
    pub link: String,

    /// Column name → selector, evaluated inside the row.
    #[serde(default = "default_field_selectors")]
    pub fields: BTreeMap<String, String>,

    /// Selector for positional attribute cells, named by `attribute_names`.
    #[serde(default = "default_attribute_selector")]
    pub attributes: String,

    #[serde(default = "default_attribute_names")]
    pub attribute_names: Vec<String>,
}

/// Pacing bounds. Seconds for page-level timings, minutes for breaks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PacingConfig {
    #[serde(default = "default_min_page_delay")]
    pub min_page_delay_secs: f64,

    #[serde(default = "default_max_page_delay")]
    pub max_page_delay_secs: f64,

    #[serde(default = "default_min_page_activity")]
    pub min_page_activity_secs: f64,

    #[serde(default = "default_max_page_activity")]
    pub max_page_activity_secs: f64,

    #[serde(default = "default_min_break")]
    pub min_break_minutes: f64,

    #[serde(default = "default_max_break")]
    pub max_break_minutes: f64,

    /// Pauses longer than this release the fetcher session first.
    #[serde(default = "default_session_release_threshold")]
    pub session_release_threshold_secs: u64,
}

/// Guards evaluated after every batch.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContinuationRules {
    #[serde(default = "default_same_day_max_batches")]
    pub same_day_max_batches: usize,

    #[serde(default = "default_daily_page_limit")]
    pub daily_page_limit: u32,

    /// Minimum session success rate, in percent.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,

    /// Local hour of day from which no further batch is started.
    #[serde(default = "default_cutoff_hour")]
    pub cutoff_hour: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_progress_path")]
    pub progress_path: PathBuf,

    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Plain-text log file; empty disables file logging.
    #[serde(default = "default_log_file")]
    pub file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Dataset columns whose most common value is shown by `stats`.
    #[serde(default = "default_top_columns")]
    pub top_columns: Vec<String>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_first_page_url() -> String {
    "https://example-realestate-site.com/listings".to_string()
}
fn default_page_url_template() -> String {
    "https://example-realestate-site.com/listings?offset={offset}&page={page}".to_string()
}
fn default_page_size() -> u32 {
    20
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
        .to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_row_selector() -> String {
    "tr.searchResultsItem".to_string()
}
fn default_link_selector() -> String {
    "a.classifiedTitle".to_string()
}
fn default_field_selectors() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("price".to_string(), "td.searchResultsPriceValue".to_string()),
        ("location".to_string(), "td.searchResultsLocationValue".to_string()),
        ("date".to_string(), "td.searchResultsDateValue".to_string()),
    ])
}
fn default_attribute_selector() -> String {
    "td.searchResultsAttributeValue".to_string()
}
fn default_attribute_names() -> Vec<String> {
    ["room_count", "area", "floor", "age"].map(String::from).to_vec()
}
fn default_min_page_delay() -> f64 {
    60.0
}
fn default_max_page_delay() -> f64 {
    150.0
}
fn default_min_page_activity() -> f64 {
    45.0
}
fn default_max_page_activity() -> f64 {
    120.0
}
fn default_min_break() -> f64 {
    15.0
}
fn default_max_break() -> f64 {
    45.0
}
fn default_session_release_threshold() -> u64 {
    300
}
fn default_same_day_max_batches() -> usize {
    1
}
fn default_daily_page_limit() -> u32 {
    50
}
fn default_success_threshold() -> f64 {
    90.0
}
fn default_cutoff_hour() -> u32 {
    18
}
fn default_progress_path() -> PathBuf {
    PathBuf::from("batch_progress.json")
}
fn default_dataset_path() -> PathBuf {
    PathBuf::from("total_scrap.csv")
}
fn default_log_file() -> String {
    "harvester.log".to_string()
}
fn default_top_columns() -> Vec<String> {
    vec!["location".to_string(), "room_count".to_string()]
}
fn default_batches() -> Vec<Batch> {
    vec![Batch::new(1, 51, 60)]
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            first_page_url: default_first_page_url(),
            page_url_template: default_page_url_template(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            selectors: SelectorConfig::default(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            row: default_row_selector(),
            link: default_link_selector(),
            fields: default_field_selectors(),
            attributes: default_attribute_selector(),
            attribute_names: default_attribute_names(),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_page_delay_secs: default_min_page_delay(),
            max_page_delay_secs: default_max_page_delay(),
            min_page_activity_secs: default_min_page_activity(),
            max_page_activity_secs: default_max_page_activity(),
            min_break_minutes: default_min_break(),
            max_break_minutes: default_max_break(),
            session_release_threshold_secs: default_session_release_threshold(),
        }
    }
}

impl Default for ContinuationRules {
    fn default() -> Self {
        Self {
            same_day_max_batches: default_same_day_max_batches(),
            daily_page_limit: default_daily_page_limit(),
            success_threshold: default_success_threshold(),
            cutoff_hour: default_cutoff_hour(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            progress_path: default_progress_path(),
            dataset_path: default_dataset_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            top_columns: default_top_columns(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scraper: ScraperConfig::default(),
            pacing: PacingConfig::default(),
            rules: ContinuationRules::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            report: ReportConfig::default(),
            batches: default_batches(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file(s) + environment overrides.
    ///
    /// With no explicit path, `config/default.toml` and `config/local.toml`
    /// are read when present. Environment variables use the `HARVEST` prefix
    /// and `__` as section separator, e.g. `HARVEST__RULES__CUTOFF_HOUR=20`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            ),
        };

        let cfg = builder
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("HARVEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    /// Check the batch plan and bounds; fills in missing batch labels.
    pub fn validate(&mut self) -> Result<()> {
        if self.batches.is_empty() {
            bail!("no batches configured");
        }

        let mut previous: Option<u32> = None;
        for batch in &mut self.batches {
            if batch.start_page > batch.end_page {
                bail!(
                    "batch {}: start page {} is after end page {}",
                    batch.id,
                    batch.start_page,
                    batch.end_page
                );
            }
            if let Some(prev) = previous {
                if batch.id <= prev {
                    bail!("batch ids must be strictly increasing ({} follows {})", batch.id, prev);
                }
            }
            previous = Some(batch.id);

            if batch.label.trim().is_empty() {
                batch.label = Batch::default_label(batch.id, batch.start_page, batch.end_page);
            }
        }

        if self.rules.cutoff_hour > 24 {
            bail!("rules.cutoff_hour must be within 0..=24, got {}", self.rules.cutoff_hour);
        }

        let p = &self.pacing;
        for (name, value) in [
            ("min_page_delay_secs", p.min_page_delay_secs),
            ("max_page_delay_secs", p.max_page_delay_secs),
            ("min_page_activity_secs", p.min_page_activity_secs),
            ("max_page_activity_secs", p.max_page_activity_secs),
            ("min_break_minutes", p.min_break_minutes),
            ("max_break_minutes", p.max_break_minutes),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("pacing.{} must be a non-negative number, got {}", name, value);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_rules() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.rules.daily_page_limit, 50);
        assert_eq!(cfg.rules.same_day_max_batches, 1);
        assert_eq!(cfg.rules.cutoff_hour, 18);
        assert_eq!(cfg.pacing.min_break_minutes, 15.0);
        assert_eq!(cfg.batches, vec![Batch::new(1, 51, 60)]);
        assert_eq!(cfg.batches[0].label, "Batch 1 (51-60)");
    }

    #[test]
    fn test_partial_toml_takes_defaults() {
        let raw = r#"
            [rules]
            daily_page_limit = 80

            [[batches]]
            id = 3
            start_page = 1
            end_page = 5
        "#;
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap();
        let mut app: AppConfig = cfg.try_deserialize().unwrap();
        app.validate().unwrap();

        assert_eq!(app.rules.daily_page_limit, 80);
        assert_eq!(app.rules.success_threshold, 90.0);
        assert_eq!(app.pacing.max_page_delay_secs, 150.0);
        assert_eq!(app.batches[0].label, "Batch 3 (1-5)");
    }

    #[test]
    fn test_validate_rejects_reversed_batch() {
        let mut cfg = AppConfig::default();
        cfg.batches = vec![Batch::new(1, 10, 5)];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unordered_ids() {
        let mut cfg = AppConfig::default();
        cfg.batches = vec![Batch::new(2, 1, 5), Batch::new(2, 6, 10)];
        assert!(cfg.validate().is_err());

        cfg.batches = vec![Batch::new(1, 1, 5), Batch::new(2, 6, 10)];
        assert!(cfg.validate().is_ok());
    }
}
