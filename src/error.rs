use std::path::PathBuf;
use thiserror::Error;

/// Progress or dataset file failure. Contained by the stores: reads fall back
/// to defaults, writes are logged and skipped.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed progress file {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed dataset file {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("dataset file {} has no `url` column", .path.display())]
    MissingKeyColumn { path: PathBuf },
}

/// A single page could not be fetched or parsed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} for page {page}")]
    Status { page: u32, status: u16 },

    #[error("no active session")]
    NoSession,

    #[error("could not build URL for page {page}: {reason}")]
    Url { page: u32, reason: String },

    #[error("extraction failed: {0}")]
    Parse(String),
}

impl FetchError {
    /// Transient failures are worth another attempt after a back-off.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::NoSession | FetchError::Url { .. } | FetchError::Parse(_) => false,
        }
    }
}

/// The external collaborator could not initialize. Fatal.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("invalid fetcher configuration: {0}")]
    Config(String),
}
