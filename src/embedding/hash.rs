//! Deterministic hashing embedder.
//!
//! Maps each token to one dimension with FNV-1a and accumulates a sign taken
//! from the hash's high bit, then l2-normalizes. Lexical, not semantic, but
//! always available and fully reproducible, which makes it the default for
//! offline runs and tests. Model names of the form `hash-<dim>` select it.

use async_trait::async_trait;

use super::{l2_normalize, EmbeddingError, EmbeddingProvider, EmbeddingResult};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Tokens shorter than this are ignored.
const MIN_TOKEN_LEN: usize = 2;

/// Default dimension, matching MiniLM-sized indexes.
pub const DEFAULT_HASH_DIMENSION: usize = 384;

/// Largest dimension a `hash-<dim>` name may request.
pub const MAX_HASH_DIMENSION: usize = 8192;

/// Prefix of model names served by this provider.
pub const HASH_MODEL_PREFIX: &str = "hash-";

#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimension: usize,
    model_name: String,
}

impl HashEmbeddingProvider {
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` for a zero dimension or one above
    /// [`MAX_HASH_DIMENSION`]
    pub fn new(dimension: usize) -> EmbeddingResult<Self> {
        if dimension == 0 {
            return Err(EmbeddingError::ConfigError(
                "Hash embedding dimension must be > 0".to_string(),
            ));
        }
        if dimension > MAX_HASH_DIMENSION {
            return Err(EmbeddingError::ConfigError(format!(
                "Hash embedding dimension {} exceeds the maximum of {}",
                dimension, MAX_HASH_DIMENSION
            )));
        }
        Ok(Self {
            dimension,
            model_name: format!("{}{}", HASH_MODEL_PREFIX, dimension),
        })
    }

    /// Parse a `hash-<dim>` model name.
    ///
    /// # Errors
    /// Returns `EmbeddingError::ModelNotFound` for names in any other form and
    /// `EmbeddingError::ConfigError` for an out-of-range dimension
    pub fn from_model_name(model_name: &str) -> EmbeddingResult<Self> {
        let dimension = model_name
            .strip_prefix(HASH_MODEL_PREFIX)
            .and_then(|d| d.parse::<usize>().ok())
            .ok_or_else(|| EmbeddingError::ModelNotFound(model_name.to_string()))?;
        Self::new(dimension)
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];
        for token in tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 1 { 1.0 } else { -1.0 };
            embedding[index] += sign;
        }
        l2_normalize(&mut embedding);
        embedding
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput("All texts must be non-empty".to_string()));
        }
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
