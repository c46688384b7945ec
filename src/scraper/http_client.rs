use crate::config::ScraperConfig;
use crate::error::{FetchError, SetupError};
use std::time::Duration;
use tracing::debug;

/// Thin reqwest wrapper. One instance per acquired session; dropping it
/// discards the cookie jar.
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self, SetupError> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .map_err(SetupError::Client)?;

        Ok(Self { inner })
    }

    /// Fetch a page as text. Single attempt; retries belong to the caller.
    pub async fn get_text(&self, page: u32, url: &str) -> Result<String, FetchError> {
        debug!("GET {} (page {})", url, page);

        let resp = self.inner.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                page,
                status: status.as_u16(),
            });
        }
        Ok(resp.text().await?)
    }
}
