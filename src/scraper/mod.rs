pub mod cleaner;
pub mod http_client;
pub mod parsers;

use async_trait::async_trait;
use chrono::Local;
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::config::ScraperConfig;
use crate::error::{FetchError, SetupError};
use crate::models::ListingRecord;
use crate::policy::PacingPlanner;

use self::cleaner::expand_page_template;
use self::http_client::HttpClient;
use self::parsers::{ListingSelectors, parse_listings};

// ── Collaborator traits ───────────────────────────────────────────────────────

/// One successfully fetched page.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    pub records: Vec<ListingRecord>,
    pub latency_secs: f64,
}

/// Swappable page source. The engine only needs records and a latency; how
/// pages are located, rendered and parsed is up to the implementation.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Open the session (browser, HTTP client, ...). Failure is fatal.
    async fn acquire(&mut self) -> Result<(), SetupError>;

    /// Tear the session down before a long pause.
    async fn release(&mut self);

    async fn fetch(&self, page: u32) -> Result<FetchedPage, FetchError>;
}

/// Low-cost activity interleaved with the sub-sleeps of an inter-page delay.
#[async_trait]
pub trait Activity: Send + Sync {
    async fn perform(&self);
}

/// Does nothing but note the tick.
pub struct Idle;

#[async_trait]
impl Activity for Idle {
    async fn perform(&self) {
        debug!("pacing tick");
    }
}

// ── HTTP listing fetcher ──────────────────────────────────────────────────────

pub struct ListingScraper {
    config: ScraperConfig,
    planner: PacingPlanner,
    selectors: ListingSelectors,
    client: Option<HttpClient>,
}

impl ListingScraper {
    pub fn new(config: &ScraperConfig, planner: PacingPlanner) -> Result<Self, SetupError> {
        Url::parse(&config.first_page_url)
            .map_err(|e| SetupError::Config(format!("first_page_url: {}", e)))?;

        Ok(Self {
            selectors: ListingSelectors::compile(&config.selectors)?,
            config: config.clone(),
            planner,
            client: None,
        })
    }

    /// URL for a results page. Page 1 has its own address.
    fn page_url(&self, page: u32) -> String {
        if page <= 1 {
            self.config.first_page_url.clone()
        } else {
            expand_page_template(&self.config.page_url_template, page, self.config.page_size)
        }
    }
}

#[async_trait]
impl PageFetcher for ListingScraper {
    async fn acquire(&mut self) -> Result<(), SetupError> {
        if self.client.is_none() {
            self.client = Some(HttpClient::new(&self.config)?);
            info!("HTTP session opened");
        }
        Ok(())
    }

    async fn release(&mut self) {
        if self.client.take().is_some() {
            info!("HTTP session closed");
        }
    }

    async fn fetch(&self, page: u32) -> Result<FetchedPage, FetchError> {
        let client = self.client.as_ref().ok_or(FetchError::NoSession)?;
        let url = self.page_url(page);
        let base = Url::parse(&url).map_err(|e| FetchError::Url {
            page,
            reason: e.to_string(),
        })?;

        info!("Scraping page {}: {}", page, url);
        let started = Instant::now();
        let html = client.get_text(page, &url).await?;
        let latency_secs = started.elapsed().as_secs_f64();

        let dwell = self.planner.page_activity();
        debug!("Page {}: dwelling {:.1}s", page, dwell.as_secs_f64());
        tokio::time::sleep(dwell).await;

        let scraped_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let records = parse_listings(&html, &self.selectors, &base, page)
            .into_iter()
            .map(|r| r.with("scraped_at", scraped_at.clone()))
            .collect();

        Ok(FetchedPage {
            records,
            latency_secs,
        })
    }
}
