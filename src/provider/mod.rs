//! Paper source module.
//!
//! This module defines the interface for discovering papers and downloading
//! their content, and includes implementations for the supported sources:
//!
//! - [`arxiv::ArxivSource`]: the arXiv export API
//! - [`journal::JournalSource`]: journal archive pages scraped by CSS selectors
//!   (Journal of Statistical Software, The R Journal)
//! - [`json::JsonFilePaperProvider`]: a local JSON file, for offline runs
//!
//! [`SourceKind`] is the configuration-level choice between them.

pub mod arxiv;
pub mod journal;
pub mod json;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Paper;
use crate::resilience::{ErrorCategory, OperationError};

pub use arxiv::ArxivSource;
pub use journal::{JournalProfile, JournalSource};
pub use json::JsonFilePaperProvider;

/// User agent sent with every HTTP request.
pub const USER_AGENT: &str = concat!("scholar-index/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur when discovering or downloading papers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Failed to read from the data source
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse the data format
    #[error("Parse error: {0}")]
    ParseError(String),

    /// API rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Other provider-specific errors
    #[error("Provider error: {0}")]
    Other(String),
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    /// Convert into a runner error, attributing source-specific failures to
    /// `source_category`.
    pub fn into_operation_error(self, source_category: ErrorCategory) -> OperationError {
        let category = match &self {
            ProviderError::NetworkError(_) => ErrorCategory::Network,
            ProviderError::IoError(_) => ErrorCategory::Storage,
            _ => source_category,
        };
        OperationError::categorized(category, self.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::NetworkError(err.to_string())
    }
}

/// Filters applied during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    /// Subject categories (e.g. `cs.AI`); empty means all
    #[serde(default)]
    pub categories: Vec<String>,

    /// Maximum number of papers to return
    pub max_results: usize,

    /// Earliest publication date, inclusive
    #[serde(default)]
    pub date_from: Option<NaiveDate>,

    /// Latest publication date, inclusive
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
}

impl DiscoveryQuery {
    pub fn new(categories: &[&str], max_results: usize) -> Self {
        Self {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            max_results,
            date_from: None,
            date_to: None,
        }
    }

    pub fn with_dates(mut self, date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> Self {
        self.date_from = date_from;
        self.date_to = date_to;
        self
    }

    /// Whether `paper` falls within the date range.
    ///
    /// Papers with only a year are compared by year; undated papers pass.
    pub fn matches_dates(&self, paper: &Paper) -> bool {
        use chrono::Datelike;

        if let Some(date) = paper.published {
            return self.date_from.map_or(true, |from| date >= from)
                && self.date_to.map_or(true, |to| date <= to);
        }
        match paper.publish_year {
            Some(year) => {
                self.date_from.map_or(true, |from| year >= from.year())
                    && self.date_to.map_or(true, |to| year <= to.year())
            }
            None => true,
        }
    }

    /// Whether `paper` shares at least one category with the query.
    pub fn matches_categories(&self, paper: &Paper) -> bool {
        self.categories.is_empty() || paper.categories.iter().any(|c| self.categories.contains(c))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Pdf,
    PlainText,
}

/// Raw content of a paper as downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedContent {
    pub paper_id: String,
    pub bytes: Vec<u8>,
    pub content_type: ContentType,
    pub source_url: Option<String>,
}

/// Trait for paper sources.
///
/// Sources return papers without an instance; the downloader stamps them
/// with the instance they are ingested into. Retrying is left to the
/// resilient runner wrapping every call.
#[async_trait]
pub trait PaperSource: Send + Sync {
    /// Get a human-readable name of this source, for logging.
    fn name(&self) -> &str;

    /// Category attributed to this source's failures.
    fn category(&self) -> ErrorCategory;

    /// List candidate papers matching `query`.
    ///
    /// # Errors
    /// Returns `ProviderError` if the listing cannot be fetched or parsed
    async fn discover(&self, query: &DiscoveryQuery) -> ProviderResult<Vec<Paper>>;

    /// Parse a raw listing (feed, page, file) into papers.
    ///
    /// # Errors
    /// Returns `ProviderError::ParseError` for malformed input
    fn extract_metadata(&self, raw: &str) -> ProviderResult<Vec<Paper>>;

    /// Download the full content of `paper`.
    ///
    /// # Errors
    /// Returns `ProviderError` if the content cannot be fetched
    async fn download(&self, paper: &Paper) -> ProviderResult<DownloadedContent>;
}

/// HTTP settings shared by the remote sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,

    /// Pause between consecutive listing requests, in milliseconds
    pub request_delay_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            request_delay_ms: 3000,
        }
    }
}

impl HttpSettings {
    /// # Errors
    /// Returns `ProviderError::ConfigError` if the client cannot be built
    pub fn client(&self) -> ProviderResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::ConfigError(format!("Failed to build HTTP client: {}", e)))
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

/// Map a non-success HTTP status to a provider error.
pub(crate) fn check_status(status: reqwest::StatusCode, url: &str) -> ProviderResult<()> {
    if status.is_success() {
        return Ok(());
    }
    Err(match status.as_u16() {
        429 => ProviderError::RateLimitExceeded(format!("HTTP 429 rate limit from {}", url)),
        404 => ProviderError::NotFound(format!("HTTP 404 not found: {}", url)),
        code => ProviderError::NetworkError(format!("HTTP {} from {}", code, url)),
    })
}

/// GET `url` and return the response body as text.
pub(crate) async fn fetch_text(client: &reqwest::Client, url: &str) -> ProviderResult<String> {
    let response = client.get(url).send().await?;
    check_status(response.status(), url)?;
    Ok(response.text().await?)
}

/// GET `url` and return the raw response body.
pub(crate) async fn fetch_bytes(client: &reqwest::Client, url: &str) -> ProviderResult<Vec<u8>> {
    let response = client.get(url).send().await?;
    check_status(response.status(), url)?;
    Ok(response.bytes().await?.to_vec())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalProfileName {
    Jss,
    RJournal,
}

/// Configured paper source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    Arxiv {
        #[serde(default)]
        api_url: Option<String>,
    },
    Journal {
        profile: JournalProfileName,
    },
    JsonFile {
        path: PathBuf,
    },
}

impl SourceKind {
    /// Build the source this configuration names.
    ///
    /// # Errors
    /// Returns `ProviderError::ConfigError` if the source cannot be set up
    pub fn build(&self, http: &HttpSettings) -> ProviderResult<Arc<dyn PaperSource>> {
        Ok(match self {
            SourceKind::Arxiv { api_url } => Arc::new(ArxivSource::new(http, api_url.as_deref())?),
            SourceKind::Journal { profile } => {
                let profile = match profile {
                    JournalProfileName::Jss => JournalProfile::jss(),
                    JournalProfileName::RJournal => JournalProfile::r_journal(),
                };
                Arc::new(JournalSource::new(profile, http)?)
            }
            SourceKind::JsonFile { path } => Arc::new(JsonFilePaperProvider::new(path.clone())),
        })
    }
}
