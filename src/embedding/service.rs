//! Embedding service with lazy model loading and a shared vector cache.
//!
//! The cache is keyed by `sha256(model_name \0 text)`, so identical text
//! embedded with the same model is computed once no matter which instance
//! asks for it. The cache lock is held only for lookups and inserts, never
//! across an `.await`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::hash::{HashEmbeddingProvider, HASH_MODEL_PREFIX};
use super::openai::{OpenAIEmbedding, OPENAI_MODEL_PREFIX};
use super::{EmbeddingError, EmbeddingProvider, EmbeddingResult};

/// Default number of texts sent to a provider per call.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Loads embedding providers by model name.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Load the provider serving `model_name`.
    ///
    /// # Errors
    /// Returns `EmbeddingError::ModelNotFound` for unknown models, or the
    /// provider's own error if loading fails
    async fn load(&self, model_name: &str) -> EmbeddingResult<Arc<dyn EmbeddingProvider>>;
}

/// Loader for the providers shipped with the crate.
///
/// - `hash-<dim>`: deterministic hashing provider
/// - `text-embedding-*`: OpenAI, when an API key is configured
/// - FastEmbed model names, with the `fastembed` feature
#[derive(Debug, Clone, Default)]
pub struct DefaultModelLoader {
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub cache_dir: Option<PathBuf>,
}

#[async_trait]
impl ModelLoader for DefaultModelLoader {
    async fn load(&self, model_name: &str) -> EmbeddingResult<Arc<dyn EmbeddingProvider>> {
        if model_name.starts_with(HASH_MODEL_PREFIX) {
            return Ok(Arc::new(HashEmbeddingProvider::from_model_name(model_name)?));
        }

        if model_name.starts_with(OPENAI_MODEL_PREFIX) {
            let api_key = self.openai_api_key.as_deref().ok_or_else(|| {
                EmbeddingError::ConfigError(format!(
                    "Model '{}' requires an OpenAI API key",
                    model_name
                ))
            })?;
            let provider = OpenAIEmbedding::new(
                api_key,
                Some(model_name.to_string()),
                self.openai_base_url.as_deref(),
            )?;
            return Ok(Arc::new(provider));
        }

        #[cfg(feature = "fastembed")]
        if super::fastembed::resolve_model(model_name).is_some() {
            let name = model_name.to_string();
            let cache_dir = self.cache_dir.clone();
            // Model initialization downloads and maps files
            let provider = tokio::task::spawn_blocking(move || {
                super::fastembed::FastEmbedProvider::new(&name, cache_dir)
            })
            .await
            .map_err(|e| EmbeddingError::Other(format!("Model loading task failed: {}", e)))??;
            return Ok(Arc::new(provider));
        }

        Err(EmbeddingError::ModelNotFound(model_name.to_string()))
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

/// Outcome of [`EmbeddingService::validate_embedding_quality`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub valid: bool,
    /// Fraction of vectors without defects, scaled down on count mismatch
    pub quality_score: f64,
    /// Expected dimensionality (the model's, or the first vector's)
    pub dimension: usize,
    pub issues: Vec<String>,
}

#[derive(Default)]
struct CacheState {
    map: HashMap<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

/// Text-to-vector service shared by every instance.
pub struct EmbeddingService {
    loader: Arc<dyn ModelLoader>,
    /// Serializes loads so each model is initialized once
    models: tokio::sync::Mutex<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    instance_models: RwLock<HashMap<String, String>>,
    cache: Mutex<CacheState>,
    batch_size: usize,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingService")
            .field("instance_models", &*self.instance_models.read())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Cache key for a `(model, text)` pair.
pub fn cache_key(model_name: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

impl EmbeddingService {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self::with_batch_size(loader, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(loader: Arc<dyn ModelLoader>, batch_size: usize) -> Self {
        Self {
            loader,
            models: tokio::sync::Mutex::new(HashMap::new()),
            instance_models: RwLock::new(HashMap::new()),
            cache: Mutex::new(CacheState::default()),
            batch_size: batch_size.max(1),
        }
    }

    /// Make `model_name` available, loading it on first use, and bind it to `instance`.
    ///
    /// Calling this again for a loaded model only updates the binding.
    ///
    /// # Returns
    /// The model's embedding dimension
    ///
    /// # Errors
    /// Returns the loader's error if the model cannot be loaded
    pub async fn initialize_model(
        &self,
        model_name: &str,
        instance: &str,
    ) -> EmbeddingResult<usize> {
        let provider = self.provider(model_name).await?;
        self.instance_models
            .write()
            .insert(instance.to_string(), model_name.to_string());
        Ok(provider.dimension())
    }

    /// Provider for `model_name`, loading it if needed.
    ///
    /// # Errors
    /// Returns the loader's error if the model cannot be loaded
    pub async fn provider(&self, model_name: &str) -> EmbeddingResult<Arc<dyn EmbeddingProvider>> {
        let mut models = self.models.lock().await;
        if let Some(provider) = models.get(model_name) {
            return Ok(Arc::clone(provider));
        }
        info!(model = %model_name, "Loading embedding model");
        let provider = self.loader.load(model_name).await?;
        models.insert(model_name.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Model bound to `instance` by [`initialize_model`](Self::initialize_model).
    pub fn instance_model(&self, instance: &str) -> Option<String> {
        self.instance_models.read().get(instance).cloned()
    }

    /// Embed `texts` with `model_name`, serving repeats from the cache.
    ///
    /// # Arguments
    /// * `texts` - Texts to embed
    /// * `instance` - Instance on whose behalf the call is made
    /// * `model_name` - Model to embed with
    ///
    /// # Returns
    /// One vector per input text, in input order
    ///
    /// # Errors
    /// Returns `EmbeddingError` if the model cannot be loaded or a batch fails;
    /// vectors computed before the failure stay cached
    pub async fn generate_embeddings(
        &self,
        texts: &[&str],
        instance: &str,
        model_name: &str,
    ) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if self.instance_model(instance).is_none() {
            self.initialize_model(model_name, instance).await?;
        }
        let provider = self.provider(model_name).await?;

        let keys: Vec<String> = texts.iter().map(|t| cache_key(model_name, t)).collect();
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<usize> = Vec::new();
        let mut pending_keys: HashMap<&str, usize> = HashMap::new();

        {
            let mut cache = self.cache.lock();
            for (i, key) in keys.iter().enumerate() {
                if let Some(vector) = cache.map.get(key) {
                    slots[i] = Some(vector.clone());
                    cache.hits += 1;
                } else {
                    cache.misses += 1;
                    pending_keys.entry(key.as_str()).or_insert_with(|| {
                        pending.push(i);
                        i
                    });
                }
            }
        }

        debug!(
            instance = %instance,
            model = %model_name,
            total = texts.len(),
            to_embed = pending.len(),
            "Generating embeddings"
        );

        for batch in pending.chunks(self.batch_size) {
            let inputs: Vec<&str> = batch.iter().map(|&i| texts[i]).collect();
            let vectors = provider.embed_batch(&inputs).await?;
            if vectors.len() != inputs.len() {
                return Err(EmbeddingError::Other(format!(
                    "Provider returned {} embeddings for {} texts",
                    vectors.len(),
                    inputs.len()
                )));
            }
            let mut cache = self.cache.lock();
            for (&i, vector) in batch.iter().zip(vectors) {
                cache.map.insert(keys[i].clone(), vector.clone());
                slots[i] = Some(vector);
            }
        }

        // Fill duplicates of texts embedded in this call
        let mut out = Vec::with_capacity(texts.len());
        for (i, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(vector) => out.push(vector),
                None => {
                    let first = pending_keys
                        .get(keys[i].as_str())
                        .copied()
                        .ok_or_else(|| {
                            EmbeddingError::Other("Missing embedding for text".to_string())
                        })?;
                    let vector = self
                        .cache
                        .lock()
                        .map
                        .get(&keys[first])
                        .cloned()
                        .ok_or_else(|| {
                            EmbeddingError::Other("Missing embedding for text".to_string())
                        })?;
                    out.push(vector);
                }
            }
        }
        Ok(out)
    }

    /// Embed a single query text.
    ///
    /// # Errors
    /// Returns `EmbeddingError` if embedding fails
    pub async fn embed_query(
        &self,
        text: &str,
        instance: &str,
        model_name: &str,
    ) -> EmbeddingResult<Vec<f32>> {
        self.generate_embeddings(&[text], instance, model_name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    /// Check a batch of embeddings for defects.
    ///
    /// Checks: one vector per text, consistent dimensionality (matching the
    /// model when it is loaded), finite values, non-zero vectors, and distinct
    /// texts not sharing an identical vector.
    pub async fn validate_embedding_quality(
        &self,
        embeddings: &[Vec<f32>],
        texts: &[&str],
        model_name: &str,
    ) -> QualityReport {
        let model_dimension = {
            let models = self.models.lock().await;
            models.get(model_name).map(|p| p.dimension())
        };
        validate_embeddings(embeddings, texts, model_dimension)
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        let lookups = cache.hits + cache.misses;
        CacheStats {
            hits: cache.hits,
            misses: cache.misses,
            entries: cache.map.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                cache.hits as f64 / lookups as f64
            },
        }
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        *cache = CacheState::default();
        info!("Embedding cache cleared");
    }

    /// Names of models loaded so far.
    pub async fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Model-independent part of the quality check.
pub fn validate_embeddings(
    embeddings: &[Vec<f32>],
    texts: &[&str],
    expected_dimension: Option<usize>,
) -> QualityReport {
    let mut issues = Vec::new();

    if embeddings.is_empty() {
        return QualityReport {
            valid: false,
            quality_score: 0.0,
            dimension: expected_dimension.unwrap_or(0),
            issues: vec!["No embeddings to validate".to_string()],
        };
    }

    let n = embeddings.len();
    if n != texts.len() {
        issues.push(format!("Embedding count {} does not match text count {}", n, texts.len()));
    }

    let dimension = expected_dimension.unwrap_or(embeddings[0].len());
    let mut defective = vec![false; n];

    for (i, vector) in embeddings.iter().enumerate() {
        if vector.len() != dimension {
            issues.push(format!(
                "Embedding {} has dimension {}, expected {}",
                i,
                vector.len(),
                dimension
            ));
            defective[i] = true;
        }
        if vector.iter().any(|v| !v.is_finite()) {
            issues.push(format!("Embedding {} contains non-finite values", i));
            defective[i] = true;
        } else if vector.iter().all(|v| *v == 0.0) {
            issues.push(format!("Embedding {} is a zero vector", i));
            defective[i] = true;
        }
    }

    let mut seen: HashMap<Vec<u32>, usize> = HashMap::new();
    for (i, vector) in embeddings.iter().enumerate() {
        let bits: Vec<u32> = vector.iter().map(|v| v.to_bits()).collect();
        match seen.get(&bits) {
            Some(&j) if texts.get(i) != texts.get(j) => {
                issues.push(format!(
                    "Embeddings {} and {} are identical for different texts",
                    j, i
                ));
                defective[i] = true;
            }
            Some(_) => {}
            None => {
                seen.insert(bits, i);
            }
        }
    }

    let clean = defective.iter().filter(|d| !**d).count();
    let mut quality_score = clean as f64 / n as f64;
    if n != texts.len() {
        quality_score *= n.min(texts.len()) as f64 / n.max(texts.len()) as f64;
    }

    QualityReport {
        valid: issues.is_empty(),
        quality_score: quality_score.clamp(0.0, 1.0),
        dimension,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Mock provider recording every batch it receives.
    #[derive(Clone)]
    struct MockEmbeddingProvider {
        model_name: String,
        dimension: usize,
        state: Arc<StdMutex<MockEmbeddingState>>,
    }

    #[derive(Default)]
    struct MockEmbeddingState {
        batch_calls: Vec<Vec<String>>,
        should_fail: bool,
    }

    impl MockEmbeddingProvider {
        fn new(model_name: &str, dimension: usize) -> Self {
            Self {
                model_name: model_name.to_string(),
                dimension,
                state: Arc::new(StdMutex::new(MockEmbeddingState::default())),
            }
        }

        fn batch_calls(&self) -> Vec<Vec<String>> {
            self.state.lock().unwrap().batch_calls.clone()
        }

        fn set_failure(&self, should_fail: bool) {
            self.state.lock().unwrap().should_fail = should_fail;
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockEmbeddingProvider {
        async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
            Ok(self.embed_batch(&[text]).await?.remove(0))
        }

        async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
            let mut state = self.state.lock().unwrap();
            state.batch_calls.push(texts.iter().map(|s| s.to_string()).collect());
            if state.should_fail {
                return Err(EmbeddingError::ApiError("Mock embed_batch failure".to_string()));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dimension];
                    v[t.len() % self.dimension] = 1.0;
                    v[0] += t.len() as f32;
                    v
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model_name(&self) -> &str {
            &self.model_name
        }
    }

    /// Loader serving one mock provider and counting loads.
    struct MockLoader {
        provider: MockEmbeddingProvider,
        loads: StdMutex<u32>,
    }

    #[async_trait]
    impl ModelLoader for MockLoader {
        async fn load(&self, model_name: &str) -> EmbeddingResult<Arc<dyn EmbeddingProvider>> {
            *self.loads.lock().unwrap() += 1;
            if model_name == self.provider.model_name {
                Ok(Arc::new(self.provider.clone()))
            } else {
                Err(EmbeddingError::ModelNotFound(model_name.to_string()))
            }
        }
    }

    fn service_with_mock(
        batch_size: usize,
    ) -> (EmbeddingService, MockEmbeddingProvider, Arc<MockLoader>) {
        let provider = MockEmbeddingProvider::new("mock-8", 8);
        let loader = Arc::new(MockLoader {
            provider: provider.clone(),
            loads: StdMutex::new(0),
        });
        let service = EmbeddingService::with_batch_size(loader.clone(), batch_size);
        (service, provider, loader)
    }

    #[tokio::test]
    async fn test_initialize_model_is_idempotent() {
        let (service, _provider, loader) = service_with_mock(4);
        assert_eq!(service.initialize_model("mock-8", "ai_scholar").await.unwrap(), 8);
        assert_eq!(service.initialize_model("mock-8", "ai_scholar").await.unwrap(), 8);
        assert_eq!(service.initialize_model("mock-8", "quant_scholar").await.unwrap(), 8);
        assert_eq!(*loader.loads.lock().unwrap(), 1);
        assert_eq!(service.instance_model("quant_scholar").as_deref(), Some("mock-8"));
        assert_eq!(service.loaded_models().await, vec!["mock-8".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let (service, _provider, _loader) = service_with_mock(4);
        let result = service.generate_embeddings(&["text"], "ai_scholar", "missing").await;
        assert!(matches!(result, Err(EmbeddingError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn test_cache_serves_repeats_across_instances() {
        let (service, provider, _loader) = service_with_mock(16);
        let first = service
            .generate_embeddings(&["alpha", "beta"], "ai_scholar", "mock-8")
            .await
            .unwrap();
        let second = service
            .generate_embeddings(&["beta", "alpha"], "quant_scholar", "mock-8")
            .await
            .unwrap();

        assert_eq!(first[0], second[1]);
        assert_eq!(first[1], second[0]);
        assert_eq!(provider.batch_calls().len(), 1, "second call is fully cached");

        let stats = service.cache_stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 2);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_duplicates_in_one_call_are_embedded_once() {
        let (service, provider, _loader) = service_with_mock(16);
        let texts = ["same", "other", "same"];
        let vectors = service.generate_embeddings(&texts, "ai_scholar", "mock-8").await.unwrap();

        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_eq!(provider.batch_calls(), vec![vec!["same".to_string(), "other".to_string()]]);
    }

    #[tokio::test]
    async fn test_batches_respect_batch_size_and_order() {
        let (service, provider, _loader) = service_with_mock(2);
        let texts = ["a1", "b22", "c333", "d4444", "e55555"];
        let vectors = service.generate_embeddings(&texts, "ai_scholar", "mock-8").await.unwrap();

        let calls = provider.batch_calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.len() <= 2));
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector[0].floor() as usize, text.len() + usize::from(text.len() % 8 == 0));
        }
    }

    #[tokio::test]
    async fn test_failure_is_propagated_and_not_cached() {
        let (service, provider, _loader) = service_with_mock(4);
        provider.set_failure(true);
        assert!(service.generate_embeddings(&["x"], "ai_scholar", "mock-8").await.is_err());
        assert_eq!(service.cache_stats().entries, 0);

        provider.set_failure(false);
        assert!(service.generate_embeddings(&["x"], "ai_scholar", "mock-8").await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let (service, provider, _loader) = service_with_mock(4);
        service.generate_embeddings(&["x"], "ai_scholar", "mock-8").await.unwrap();
        service.clear_cache();
        assert_eq!(service.cache_stats().entries, 0);
        service.generate_embeddings(&["x"], "ai_scholar", "mock-8").await.unwrap();
        assert_eq!(provider.batch_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_default_loader_serves_hash_models() {
        let service = EmbeddingService::new(Arc::new(DefaultModelLoader::default()));
        assert_eq!(service.initialize_model("hash-32", "ai_scholar").await.unwrap(), 32);
        let v = service
            .embed_query("transformer attention", "ai_scholar", "hash-32")
            .await
            .unwrap();
        assert_eq!(v.len(), 32);

        let openai = service.initialize_model("text-embedding-3-small", "ai_scholar").await;
        assert!(matches!(openai, Err(EmbeddingError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_quality_of_good_embeddings() {
        let service = EmbeddingService::new(Arc::new(DefaultModelLoader::default()));
        let texts = ["deep learning for vision", "stochastic volatility models"];
        let vectors = service.generate_embeddings(&texts, "ai_scholar", "hash-64").await.unwrap();

        let report = service.validate_embedding_quality(&vectors, &texts, "hash-64").await;
        assert!(report.valid, "issues: {:?}", report.issues);
        assert_eq!(report.quality_score, 1.0);
        assert_eq!(report.dimension, 64);
    }

    #[test]
    fn test_quality_detects_defects() {
        let good = vec![0.5, 0.5, 0.5, 0.5];
        let embeddings = vec![
            good.clone(),
            vec![0.0; 4],
            vec![f32::NAN, 0.0, 0.0, 1.0],
            vec![1.0; 3],
            good,
        ];
        let texts = ["a", "b", "c", "d", "e"];

        let report = validate_embeddings(&embeddings, &texts, Some(4));
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.contains("zero vector")));
        assert!(report.issues.iter().any(|i| i.contains("non-finite")));
        assert!(report.issues.iter().any(|i| i.contains("dimension 3")));
        assert!(report.issues.iter().any(|i| i.contains("identical")));
        assert!((report.quality_score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_quality_count_mismatch_and_empty() {
        let report = validate_embeddings(&[vec![1.0, 0.0]], &["a", "b"], None);
        assert!(!report.valid);
        assert!((report.quality_score - 0.5).abs() < 1e-9);

        let empty = validate_embeddings(&[], &[], Some(8));
        assert!(!empty.valid);
        assert_eq!(empty.quality_score, 0.0);
    }

    #[test]
    fn test_cache_key_depends_on_model() {
        assert_ne!(cache_key("hash-8", "text"), cache_key("hash-16", "text"));
        assert_eq!(cache_key("hash-8", "text"), cache_key("hash-8", "text"));
        assert_eq!(cache_key("m", "t").len(), 64);
    }
}
