//! OpenAI embedding provider implementation.
//!
//! This module provides an implementation of the `EmbeddingProvider` trait
//! using OpenAI's text embedding API (or any compatible endpoint). Requests
//! are sent once; retrying is left to the resilient runner wrapping the
//! caller so that backoff and circuit breaking stay in one place.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingProvider, EmbeddingResult};

/// Default OpenAI API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Prefix shared by OpenAI embedding model names.
pub const OPENAI_MODEL_PREFIX: &str = "text-embedding-";

/// Largest batch a single request may carry.
const MAX_BATCH_SIZE: usize = 256;

/// OpenAI embedding provider.
#[derive(Debug, Clone)]
pub struct OpenAIEmbedding {
    client: Client,

    /// Full URL of the embeddings endpoint
    endpoint: String,

    /// Model identifier (e.g., "text-embedding-3-small")
    model: String,

    /// Expected dimension of the embedding vectors
    embedding_dimension: usize,
}

impl OpenAIEmbedding {
    /// Create a new OpenAI embedding provider.
    ///
    /// # Arguments
    /// * `api_key` - OpenAI API key
    /// * `model` - Model name (defaults to "text-embedding-3-small" if None)
    /// * `base_url` - API base URL (defaults to the public OpenAI endpoint)
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` for a blank key or an HTTP client
    /// that cannot be built
    pub fn new(
        api_key: &str,
        model: Option<String>,
        base_url: Option<&str>,
    ) -> EmbeddingResult<Self> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::ConfigError("Missing OpenAI API key".to_string()));
        }
        let model = model.unwrap_or_else(|| crate::DEFAULT_OPENAI_MODEL.to_string());
        let embedding_dimension = Self::dimension_for(&model);

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|e| EmbeddingError::ConfigError(format!("Invalid OpenAI API key: {}", e)))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| {
                EmbeddingError::ConfigError(format!("Failed to build HTTP client: {}", e))
            })?;

        let endpoint = format!(
            "{}/embeddings",
            base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/')
        );

        Ok(Self {
            client,
            endpoint,
            model,
            embedding_dimension,
        })
    }

    /// Known output dimension of an OpenAI embedding model.
    pub fn dimension_for(model: &str) -> usize {
        match model {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        }
    }

    async fn request(&self, inputs: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::ApiError(format!(
                "OpenAI embeddings request failed ({}): {}",
                status, body
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| {
                EmbeddingError::ApiError(format!("Failed to parse embedding response: {}", e))
            })?;
        parsed.data.sort_by_key(|entry| entry.index);

        if parsed.data.len() != inputs.len() {
            return Err(EmbeddingError::ApiError(format!(
                "OpenAI returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|entry| entry.embedding).collect();
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.embedding_dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.embedding_dimension,
                actual: bad.len(),
            });
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedding {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }
        self.request(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput("All texts must be non-empty".to_string()));
        }

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH_SIZE) {
            out.extend(self.request(batch).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
