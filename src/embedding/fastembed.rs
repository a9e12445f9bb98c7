//! FastEmbed embedding provider implementation.
//!
//! Runs ONNX embedding models locally through the fastembed library, so
//! ingestion does not depend on an external API. Compiled only with the
//! `fastembed` feature.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;

use super::{EmbeddingError, EmbeddingProvider, EmbeddingResult};

/// Local FastEmbed provider.
#[derive(Clone)]
pub struct FastEmbedProvider {
    /// The embedding model instance (wrapped in Arc<Mutex> for thread-safety)
    model: Arc<Mutex<TextEmbedding>>,

    /// Model identifier as requested by the caller
    model_name: String,

    /// Expected dimension of the embedding vectors
    embedding_dimension: usize,
}

/// Resolve a model name used in instance configs to a fastembed model and its dimension.
pub fn resolve_model(model_name: &str) -> Option<(EmbeddingModel, usize)> {
    let resolved = match model_name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
            (EmbeddingModel::AllMiniLML6V2, 384)
        }
        "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
        "bge-base-en-v1.5" | "baai/bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
        "bge-large-en-v1.5" | "baai/bge-large-en-v1.5" => (EmbeddingModel::BGELargeENV15, 1024),
        "nomic-embed-text-v1.5" => (EmbeddingModel::NomicEmbedTextV15, 768),
        "paraphrase-multilingual-minilm-l12-v2" => (EmbeddingModel::ParaphraseMLMiniLML12V2, 384),
        _ => return None,
    };
    Some(resolved)
}

impl FastEmbedProvider {
    /// Load a FastEmbed model by name.
    ///
    /// # Arguments
    /// * `model_name` - One of the names accepted by [`resolve_model`]
    /// * `cache_dir` - Optional cache directory for model files
    ///
    /// # Errors
    /// Returns `EmbeddingError::ModelNotFound` for unknown names and
    /// `EmbeddingError::ConfigError` if the model fails to initialize
    pub fn new(model_name: &str, cache_dir: Option<PathBuf>) -> EmbeddingResult<Self> {
        let (model_type, embedding_dimension) = resolve_model(model_name)
            .ok_or_else(|| EmbeddingError::ModelNotFound(model_name.to_string()))?;

        let mut init_options = InitOptions::new(model_type);
        if let Some(dir) = cache_dir {
            init_options = init_options.with_cache_dir(dir);
        }

        let text_embedding = TextEmbedding::try_new(init_options).map_err(|e| {
            EmbeddingError::ConfigError(format!("Failed to initialize FastEmbed model: {}", e))
        })?;

        Ok(Self {
            model: Arc::new(Mutex::new(text_embedding)),
            model_name: model_name.to_string(),
            embedding_dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput("All texts must be non-empty".to_string()));
        }

        #[allow(unused_mut)]
        let mut model = self.model.lock().await;
        let owned: Vec<String> = texts.iter().map(|s| s.to_string()).collect();
        model
            .embed(owned, None)
            .map_err(|e| EmbeddingError::Other(format!("Batch embedding generation failed: {}", e)))
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

// TextEmbedding does not implement Debug
impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("model_name", &self.model_name)
            .field("embedding_dimension", &self.embedding_dimension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_model_names() {
        assert_eq!(resolve_model("all-MiniLM-L6-v2").map(|(_, d)| d), Some(384));
        assert_eq!(resolve_model("BAAI/bge-base-en-v1.5").map(|(_, d)| d), Some(768));
        assert!(resolve_model("hash-384").is_none());
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        assert!(matches!(
            FastEmbedProvider::new("not-a-model", None),
            Err(EmbeddingError::ModelNotFound(_))
        ));
    }
}
