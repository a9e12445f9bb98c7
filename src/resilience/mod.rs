//! Resilience layer for flaky network and storage operations.
//!
//! This module provides the pieces that guard every fallible step of the
//! ingestion pipeline:
//!
//! - [`retry::RetryPolicy`]: pure exponential backoff calculator
//! - [`circuit_breaker::CircuitBreaker`]: per-category failure gate
//! - [`classifier::ErrorClassifier`]: error taxonomy, pattern detection and health
//! - [`runner::ResilientRunner`]: composes the three to execute async operations
//!
//! Errors flowing into the runner are expressed as [`OperationError`], which
//! keeps cancellation distinct from ordinary failures and may carry a
//! category hint from the module that produced it.

pub mod circuit_breaker;
pub mod classifier;
pub mod retry;
pub mod runner;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitState,
};
pub use classifier::{
    ClassifierConfig, ErrorClassifier, ErrorReport, ErrorStats, HealthStatus, ProcessingError,
};
pub use retry::{RetryPolicies, RetryPolicy};
pub use runner::{ResilientRunner, RunError};

/// Closed taxonomy of failure categories.
///
/// Every failure recorded by the classifier lands in exactly one category,
/// and circuit breakers and retry policies are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport-level failures (connect, DNS, timeouts)
    Network,
    /// arXiv export API failures
    ArxivApi,
    /// Journal website scraping failures
    JournalSource,
    /// PDF or text extraction failures
    PdfProcessing,
    /// Embedding or vector index failures
    VectorStore,
    /// Metadata persistence failures
    Storage,
    /// Anything the classifier could not place
    Unknown,
}

impl ErrorCategory {
    /// All categories, in declaration order.
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Network,
        ErrorCategory::ArxivApi,
        ErrorCategory::JournalSource,
        ErrorCategory::PdfProcessing,
        ErrorCategory::VectorStore,
        ErrorCategory::Storage,
        ErrorCategory::Unknown,
    ];

    /// Stable snake_case identifier used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::ArxivApi => "arxiv_api",
            ErrorCategory::JournalSource => "journal_source",
            ErrorCategory::PdfProcessing => "pdf_processing",
            ErrorCategory::VectorStore => "vector_store",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Whether failures in this category are worth retrying.
    ///
    /// A document that fails to extract will fail the same way again, so
    /// `PdfProcessing` is recorded and skipped. Everything else is transient
    /// until proven otherwise.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::PdfProcessing)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to a classified failure. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by an operation executed under the [`ResilientRunner`].
#[derive(Debug, Clone, Error)]
pub enum OperationError {
    /// The operation was cancelled; never retried.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation failed; `category_hint` short-circuits classification
    #[error("{message}")]
    Failed {
        message: String,
        category_hint: Option<ErrorCategory>,
    },
}

impl OperationError {
    /// A failure without a category hint; the classifier decides.
    pub fn failed(message: impl Into<String>) -> Self {
        OperationError::Failed {
            message: message.into(),
            category_hint: None,
        }
    }

    /// A failure the producer already knows the category of.
    pub fn categorized(category: ErrorCategory, message: impl Into<String>) -> Self {
        OperationError::Failed {
            message: message.into(),
            category_hint: Some(category),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }
}

/// Describes the operation being executed, for classification and logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Operation name, e.g. `download_pdf` or `store_chunks`
    pub operation: String,

    /// Instance the operation is working for, if any
    pub instance_name: Option<String>,

    /// Paper the operation is working on, if any
    pub paper_id: Option<String>,

    /// Free-form extra fields copied into recorded errors
    pub extra: BTreeMap<String, String>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_instance(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = Some(instance_name.into());
        self
    }

    pub fn with_paper(mut self, paper_id: impl Into<String>) -> Self {
        self.paper_id = Some(paper_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Flatten the context into the key/value map stored on a [`ProcessingError`].
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = self.extra.clone();
        fields.insert("operation".to_string(), self.operation.clone());
        if let Some(instance) = &self.instance_name {
            fields.insert("instance_name".to_string(), instance.clone());
        }
        if let Some(paper_id) = &self.paper_id {
            fields.insert("paper_id".to_string(), paper_id.clone());
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_serde_names() {
        let json = serde_json::to_string(&ErrorCategory::ArxivApi).unwrap();
        assert_eq!(json, "\"arxiv_api\"");

        let parsed: ErrorCategory = serde_json::from_str("\"pdf_processing\"").unwrap();
        assert_eq!(parsed, ErrorCategory::PdfProcessing);

        for category in ErrorCategory::ALL {
            let encoded = serde_json::to_string(&category).unwrap();
            assert_eq!(encoded.trim_matches('"'), category.as_str());
        }
    }

    #[test]
    fn test_only_pdf_processing_is_not_retryable() {
        for category in ErrorCategory::ALL {
            assert_eq!(
                category.is_retryable(),
                category != ErrorCategory::PdfProcessing,
                "unexpected retryability for {}",
                category
            );
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_context_fields() {
        let ctx = OperationContext::new("download_pdf")
            .with_instance("ai_scholar")
            .with_paper("2401.00001")
            .with_field("source", "arxiv");

        let fields = ctx.to_fields();
        assert_eq!(fields.get("operation").map(String::as_str), Some("download_pdf"));
        assert_eq!(fields.get("instance_name").map(String::as_str), Some("ai_scholar"));
        assert_eq!(fields.get("paper_id").map(String::as_str), Some("2401.00001"));
        assert_eq!(fields.get("source").map(String::as_str), Some("arxiv"));
    }

    #[test]
    fn test_operation_error_constructors() {
        let err = OperationError::categorized(ErrorCategory::Storage, "disk full");
        assert_eq!(err.to_string(), "disk full");
        assert!(!err.is_cancelled());
        assert!(OperationError::Cancelled.is_cancelled());
    }
}
