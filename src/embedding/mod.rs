//! Embedding provider abstraction and implementations.
//!
//! This module defines the interface for text embedding generation and provides
//! implementations for several embedding backends:
//!
//! - [`hash::HashEmbeddingProvider`]: deterministic lexical hashing, no model files
//! - [`openai::OpenAIEmbedding`]: OpenAI embeddings API
//! - `fastembed::FastEmbedProvider`: local ONNX models (behind the `fastembed` feature)
//!
//! On top of the providers, [`service::EmbeddingService`] loads models lazily per
//! instance, caches vectors by `(model, text)` and validates embedding quality.

pub mod hash;
pub mod openai;
pub mod service;

#[cfg(feature = "fastembed")]
pub mod fastembed;

use async_trait::async_trait;
use thiserror::Error;

use crate::resilience::{ErrorCategory, OperationError};

pub use service::{CacheStats, DefaultModelLoader, EmbeddingService, ModelLoader, QualityReport};

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// API answered with an error
    #[error("API request failed: {0}")]
    ApiError(String),

    /// Transport-level failure talking to the API
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid input text (e.g., empty, too long)
    #[error("Invalid input text: {0}")]
    InvalidInput(String),

    /// Configuration error (e.g., missing API key)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The requested model is not known to any loader
    #[error("Unknown embedding model: {0}")]
    ModelNotFound(String),

    /// Provider returned a vector of the wrong size
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Other unexpected errors
    #[error("Unexpected error: {0}")]
    Other(String),
}

/// Result type for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

impl From<EmbeddingError> for OperationError {
    fn from(err: EmbeddingError) -> Self {
        let category = match err {
            EmbeddingError::NetworkError(_) => ErrorCategory::Network,
            _ => ErrorCategory::VectorStore,
        };
        OperationError::categorized(category, err.to_string())
    }
}

/// Trait for text embedding providers.
///
/// Implementors of this trait can generate vector embeddings from text inputs.
/// The trait is async to support API-based embedding services.
///
/// # Example Usage
/// ```ignore
/// let provider = HashEmbeddingProvider::new(384)?;
/// let text = normalize_text("Research paper abstract");
/// let embedding = provider.embed(&text).await?;
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Arguments
    /// * `text` - The input text to embed
    ///
    /// # Returns
    /// A vector of f32 values representing the embedding
    ///
    /// # Errors
    /// Returns `EmbeddingError` if the embedding generation fails
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    /// Generate embeddings for multiple texts in a single batch.
    ///
    /// # Arguments
    /// * `texts` - Slice of text inputs to embed
    ///
    /// # Returns
    /// A vector of embedding vectors, in the same order as the input texts
    ///
    /// # Errors
    /// Returns `EmbeddingError` if any embedding generation fails
    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>>;

    /// Get the dimension of embeddings produced by this provider.
    fn dimension(&self) -> usize;

    /// Get the model name/identifier for this provider.
    fn model_name(&self) -> &str;
}

/// Normalizes text for consistent embedding generation.
///
/// This function applies the following transformations:
/// - Converts to lowercase
/// - Trims leading/trailing whitespace
/// - Collapses runs of whitespace to a single space
///
/// # Example
/// ```ignore
/// let normalized = normalize_text("  Hello   World  ");
/// assert_eq!(normalized, "hello world");
/// ```
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
