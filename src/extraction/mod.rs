//! Text extraction from downloaded content.
//!
//! PDFs go through `pdf-extract` on the blocking thread pool; plain text is
//! validated as UTF-8. Either way the result is cleaned before chunking:
//! words hyphenated across line breaks are rejoined, control characters and
//! trailing spaces are dropped, and runs of blank lines collapse to one.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::provider::{ContentType, DownloadedContent};
use crate::resilience::{ErrorCategory, OperationError};

static HYPHEN_BREAK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{L})-[ \t]*\n[ \t]*(\p{Ll})").expect("hyphen regex"));
static TRAILING_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+\n").expect("trailing space regex"));
static BLANK_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("blank run regex"));
static INLINE_SPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("inline space regex"));

/// Errors that can occur while extracting text.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// PDF could not be parsed
    #[error("PDF extraction failed for {paper_id}: {message}")]
    Pdf { paper_id: String, message: String },

    /// Plain text content is not valid UTF-8
    #[error("Invalid UTF-8 text for {0}")]
    InvalidUtf8(String),

    /// Extraction produced no usable text (image-only or encrypted PDF)
    #[error("No extractable text in {0}")]
    EmptyText(String),

    /// Background extraction task failed
    #[error("Extraction task failed: {0}")]
    TaskFailed(String),
}

/// Result type for extraction operations.
pub type ExtractionResult<T> = Result<T, ExtractionError>;

impl From<ExtractionError> for OperationError {
    fn from(err: ExtractionError) -> Self {
        OperationError::categorized(ErrorCategory::PdfProcessing, err.to_string())
    }
}

/// Turns downloaded content into clean text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// # Errors
    /// Returns `ExtractionError` if the content cannot be decoded or holds no text
    async fn extract(&self, content: &DownloadedContent) -> ExtractionResult<String>;
}

/// Extractor for PDF and plain-text content.
#[derive(Debug, Clone)]
pub struct DocumentExtractor {
    /// Cleaned text shorter than this is rejected as empty
    pub min_text_len: usize,
}

impl Default for DocumentExtractor {
    fn default() -> Self {
        Self { min_text_len: 1 }
    }
}

impl DocumentExtractor {
    pub fn new(min_text_len: usize) -> Self {
        Self {
            min_text_len: min_text_len.max(1),
        }
    }
}

#[async_trait]
impl TextExtractor for DocumentExtractor {
    async fn extract(&self, content: &DownloadedContent) -> ExtractionResult<String> {
        let raw = match content.content_type {
            ContentType::Pdf => {
                let bytes = content.bytes.clone();
                tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
                    .await
                    .map_err(|e| ExtractionError::TaskFailed(e.to_string()))?
                    .map_err(|e| ExtractionError::Pdf {
                        paper_id: content.paper_id.clone(),
                        message: e.to_string(),
                    })?
            }
            ContentType::PlainText => String::from_utf8(content.bytes.clone())
                .map_err(|_| ExtractionError::InvalidUtf8(content.paper_id.clone()))?,
        };

        let text = clean_text(&raw);
        if text.chars().count() < self.min_text_len {
            return Err(ExtractionError::EmptyText(content.paper_id.clone()));
        }
        debug!(
            paper_id = %content.paper_id,
            raw_len = raw.len(),
            clean_len = text.len(),
            "Extracted text"
        );
        Ok(text)
    }
}

/// Normalize extracted text for chunking.
pub fn clean_text(raw: &str) -> String {
    let text: String = raw
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .map(|c| if c == '\t' { ' ' } else { c })
        .collect();
    let text = HYPHEN_BREAK_RE.replace_all(&text, "$1$2");
    let text = TRAILING_SPACE_RE.replace_all(&text, "\n");
    let text = INLINE_SPACE_RE.replace_all(&text, " ");
    let text = BLANK_RUN_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(text: &[u8]) -> DownloadedContent {
        DownloadedContent {
            paper_id: "p1".to_string(),
            bytes: text.to_vec(),
            content_type: ContentType::PlainText,
            source_url: None,
        }
    }

    #[test]
    fn test_clean_text() {
        let raw = "Deep learn-\ning models\r\n\r\n\r\n\r\nwork   well.  \nNext\u{0} line\tend";
        assert_eq!(clean_text(raw), "Deep learning models\n\nwork well.\nNext line end");
    }

    #[test]
    fn test_keeps_real_hyphens() {
        assert_eq!(clean_text("state-of-the-art\nResults"), "state-of-the-art\nResults");
        assert_eq!(clean_text("Monte-\nCarlo"), "Monte-\nCarlo");
    }

    #[tokio::test]
    async fn test_plain_text_extraction() {
        let extractor = DocumentExtractor::default();
        let text = extractor.extract(&plain(b"  Hello   world.  ")).await.unwrap();
        assert_eq!(text, "Hello world.");
    }

    #[tokio::test]
    async fn test_empty_and_invalid_content() {
        let extractor = DocumentExtractor::new(10);
        assert!(matches!(
            extractor.extract(&plain(b"   \n\n ")).await,
            Err(ExtractionError::EmptyText(_))
        ));
        assert!(matches!(
            extractor.extract(&plain(b"short")).await,
            Err(ExtractionError::EmptyText(_))
        ));
        assert!(matches!(
            extractor.extract(&plain(&[0xff, 0xfe, 0x00])).await,
            Err(ExtractionError::InvalidUtf8(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_pdf_is_pdf_processing() {
        let content = DownloadedContent {
            paper_id: "broken".to_string(),
            bytes: b"not a pdf".to_vec(),
            content_type: ContentType::Pdf,
            source_url: None,
        };
        let err = DocumentExtractor::default().extract(&content).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Pdf { .. } | ExtractionError::TaskFailed(_)));
        let op: OperationError = err.into();
        assert!(matches!(
            op,
            OperationError::Failed { category_hint: Some(ErrorCategory::PdfProcessing), .. }
        ));
    }
}
