//! Multi-instance vector store.
//!
//! Each instance is bound to one collection and one embedding model. Writes
//! and instance-scoped searches touch only the instance's own collection;
//! cross-instance search fans out to every initialized instance and merges
//! the results into a global ranking.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chunking::{chunk_with, Chunk, ChunkerConfig, ChunkingError, ChunkingStrategy};
use crate::collection::{
    collection_name, CollectionError, CollectionManager, CollectionStats, CreateOutcome,
    IntegrityReport,
};
use crate::embedding::{EmbeddingError, EmbeddingService};
use crate::models::{Paper, RelevanceLevel, SearchHit};
use crate::query::{best_per_paper, merge_global, QueryError, SearchQuery, MAX_N_RESULTS};
use crate::resilience::{ErrorCategory, OperationError};
use crate::storage::{Metadata, QueryHit, StorageError, VectorRecord};

/// Errors raised by the multi-instance store.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// Operation on an instance that was never initialized
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    /// Paper stamped with a different instance than the one addressed
    #[error("Paper belongs to instance '{actual}', not '{expected}'")]
    InstanceMismatch { expected: String, actual: String },

    /// Chunk produced for a different paper
    #[error("Chunk {chunk_id} belongs to document '{actual}', not '{expected}'")]
    DocumentMismatch {
        chunk_id: String,
        expected: String,
        actual: String,
    },

    #[error("Paper {0} has no chunks")]
    EmptyDocument(String),

    #[error("Invalid instance configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Chunking(#[from] ChunkingError),
}

pub type VectorStoreResult<T> = Result<T, VectorStoreError>;

impl VectorStoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            VectorStoreError::Storage(e) => e.category(),
            VectorStoreError::Embedding(EmbeddingError::NetworkError(_)) => ErrorCategory::Network,
            VectorStoreError::Chunking(_) => ErrorCategory::PdfProcessing,
            _ => ErrorCategory::VectorStore,
        }
    }
}

impl From<VectorStoreError> for OperationError {
    fn from(err: VectorStoreError) -> Self {
        OperationError::categorized(err.category(), err.to_string())
    }
}

/// Per-instance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Embedding model for this instance's chunks and queries
    pub embedding_model: String,

    /// Level-0 chunk size in bytes
    pub chunk_size: usize,

    /// Bytes neighbouring chunks may share
    pub chunk_overlap: usize,

    pub strategy: ChunkingStrategy,

    pub description: Option<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            embedding_model: crate::DEFAULT_EMBEDDING_MODEL.to_string(),
            chunk_size: 1000,
            chunk_overlap: 100,
            strategy: ChunkingStrategy::default(),
            description: None,
        }
    }
}

impl InstanceConfig {
    pub fn new(embedding_model: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            embedding_model: embedding_model.into(),
            chunk_size,
            chunk_overlap: chunk_size / 10,
            ..Self::default()
        }
    }

    /// Chunker configuration derived from this instance's settings.
    pub fn chunker_config(&self) -> ChunkerConfig {
        let overlap_percentage = if self.chunk_size == 0 {
            0.0
        } else {
            self.chunk_overlap as f64 / self.chunk_size as f64
        };
        ChunkerConfig {
            strategy: self.strategy,
            base_chunk_size: self.chunk_size,
            overlap_percentage,
            ..ChunkerConfig::default()
        }
    }

    /// # Errors
    /// Returns `VectorStoreError::InvalidConfig` for a blank model or bad chunk sizes
    pub fn validate(&self) -> VectorStoreResult<()> {
        if self.embedding_model.trim().is_empty() {
            return Err(VectorStoreError::InvalidConfig(
                "embedding_model cannot be empty".to_string(),
            ));
        }
        self.chunker_config()
            .validate()
            .map_err(|e| VectorStoreError::InvalidConfig(e.to_string()))
    }
}

#[derive(Debug, Clone)]
struct InstanceState {
    config: InstanceConfig,
    collection_name: String,
    dimension: usize,
    initialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOutcome {
    pub chunks_added: usize,
    pub collection_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub instance_name: String,
    pub config: InstanceConfig,
    pub dimension: usize,
    pub initialized_at: DateTime<Utc>,
    pub collection: CollectionStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub status: HealthState,
    pub collection_name: String,
    pub chunk_count: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthState,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub instance_health: BTreeMap<String, InstanceHealth>,
    pub checked_at: DateTime<Utc>,
}

/// A record found in a collection owned by another instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contamination {
    pub collection_instance: String,
    pub record_id: String,
    pub record_instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeparationReport {
    pub separation_valid: bool,
    pub instances_checked: usize,
    pub issues: Vec<String>,
    pub cross_contamination: Vec<Contamination>,
}

/// Vector store shared by all instances.
pub struct MultiInstanceVectorStore {
    collections: CollectionManager,
    embeddings: Arc<EmbeddingService>,
    instances: RwLock<BTreeMap<String, InstanceState>>,
}

impl std::fmt::Debug for MultiInstanceVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiInstanceVectorStore")
            .field("instances", &self.list_instances())
            .finish_non_exhaustive()
    }
}

fn meta_str<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

impl MultiInstanceVectorStore {
    pub fn new(collections: CollectionManager, embeddings: Arc<EmbeddingService>) -> Self {
        Self {
            collections,
            embeddings,
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn collections(&self) -> &CollectionManager {
        &self.collections
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    fn state(&self, instance: &str) -> VectorStoreResult<InstanceState> {
        self.instances
            .read()
            .get(instance)
            .cloned()
            .ok_or_else(|| VectorStoreError::UnknownInstance(instance.to_string()))
    }

    /// Register an instance: load its embedding model and create its collection.
    ///
    /// Re-initializing an instance replaces its configuration; the collection
    /// and its records are kept.
    ///
    /// # Errors
    /// Returns `VectorStoreError` for an invalid name or configuration, a model
    /// that cannot be loaded, or a backend failure
    pub async fn initialize_instance(
        &self,
        instance: &str,
        config: InstanceConfig,
    ) -> VectorStoreResult<CreateOutcome> {
        collection_name(instance)?;
        config.validate()?;

        let dimension = self.embeddings.initialize_model(&config.embedding_model, instance).await?;
        let outcome = self
            .collections
            .create_instance_collection(
                instance,
                &config.embedding_model,
                config.description.as_deref(),
            )
            .await?;

        let existing_model = self
            .collections
            .backend()
            .collection_metadata(&outcome.collection_name)
            .await?
            .get("embedding_model")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(existing) = existing_model.filter(|m| *m != config.embedding_model) {
            warn!(
                instance = %instance,
                collection_model = %existing,
                configured_model = %config.embedding_model,
                "Instance collection was created with a different embedding model"
            );
        }

        info!(
            instance = %instance,
            model = %config.embedding_model,
            dimension,
            chunk_size = config.chunk_size,
            "Initialized instance"
        );
        self.instances.write().insert(
            instance.to_string(),
            InstanceState {
                config,
                collection_name: outcome.collection_name.clone(),
                dimension,
                initialized_at: Utc::now(),
            },
        );
        Ok(outcome)
    }

    /// Configuration of an initialized instance.
    pub fn instance_config(&self, instance: &str) -> Option<InstanceConfig> {
        self.instances.read().get(instance).map(|s| s.config.clone())
    }

    /// Initialized instances, sorted by name.
    pub fn list_instances(&self) -> Vec<String> {
        self.instances.read().keys().cloned().collect()
    }

    /// Forget an instance, optionally dropping its collection.
    ///
    /// # Returns
    /// `true` if the instance was registered
    pub async fn remove_instance(
        &self,
        instance: &str,
        delete_collection: bool,
    ) -> VectorStoreResult<bool> {
        let removed = self.instances.write().remove(instance).is_some();
        if delete_collection {
            self.collections.delete_instance_collection(instance).await?;
        }
        if removed {
            info!(instance = %instance, delete_collection, "Removed instance");
        }
        Ok(removed)
    }

    /// Split `text` with the instance's chunker configuration.
    ///
    /// # Errors
    /// Returns `VectorStoreError::UnknownInstance` or the chunker's error
    pub fn chunk_for_instance(
        &self,
        instance: &str,
        paper_id: &str,
        text: &str,
    ) -> VectorStoreResult<Vec<Chunk>> {
        let state = self.state(instance)?;
        Ok(chunk_with(&state.config.chunker_config(), paper_id, text)?)
    }

    /// Embed and store a paper's chunks in the instance's collection.
    ///
    /// # Arguments
    /// * `instance` - Target instance
    /// * `paper` - Paper the chunks were produced from; must be stamped with `instance`
    /// * `chunks` - Chunks of that paper
    ///
    /// # Errors
    /// Returns `VectorStoreError` if the instance is unknown, the paper or a
    /// chunk belongs elsewhere, or embedding/storage fails. Nothing is written
    /// on error.
    pub async fn add_instance_document(
        &self,
        instance: &str,
        paper: &Paper,
        chunks: &[Chunk],
    ) -> VectorStoreResult<AddOutcome> {
        let state = self.state(instance)?;
        if paper.instance_name != instance {
            return Err(VectorStoreError::InstanceMismatch {
                expected: instance.to_string(),
                actual: paper.instance_name.clone(),
            });
        }
        if chunks.is_empty() {
            return Err(VectorStoreError::EmptyDocument(paper.id.clone()));
        }
        if let Some(stray) = chunks.iter().find(|c| c.document_id != paper.id) {
            return Err(VectorStoreError::DocumentMismatch {
                chunk_id: stray.id.clone(),
                expected: paper.id.clone(),
                actual: stray.document_id.clone(),
            });
        }

        let model = &state.config.embedding_model;
        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let vectors = self.embeddings.generate_embeddings(&texts, instance, model).await?;

        let added_at = Utc::now().to_rfc3339();
        let authors = paper.author_names();
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, embedding)| VectorRecord {
                id: chunk.id.clone(),
                document: chunk.content.clone(),
                metadata: chunk_metadata(instance, paper, chunk, &authors, model, &added_at),
                embedding,
            })
            .collect();

        let written = self.collections.backend().add(&state.collection_name, records).await?;
        debug!(instance = %instance, paper_id = %paper.id, chunks = written, "Added document");
        Ok(AddOutcome {
            chunks_added: written,
            collection_name: state.collection_name,
        })
    }

    /// Chunk `text` with the instance's settings and add the result.
    ///
    /// # Errors
    /// See [`chunk_for_instance`](Self::chunk_for_instance) and
    /// [`add_instance_document`](Self::add_instance_document)
    pub async fn add_paper_text(
        &self,
        instance: &str,
        paper: &Paper,
        text: &str,
    ) -> VectorStoreResult<AddOutcome> {
        let chunks = self.chunk_for_instance(instance, &paper.id, text)?;
        self.add_instance_document(instance, paper, &chunks).await
    }

    /// Search one instance's collection.
    ///
    /// # Returns
    /// Hits best first, each tagged with `instance`; hits whose metadata names
    /// another instance are dropped
    ///
    /// # Errors
    /// Returns `VectorStoreError` for an invalid query, an unknown instance, or
    /// an embedding/storage failure
    pub async fn search_instance_papers(
        &self,
        instance: &str,
        query: &str,
        n_results: usize,
    ) -> VectorStoreResult<Vec<SearchHit>> {
        SearchQuery::new(query, Some(n_results)).validate()?;
        let state = self.state(instance)?;

        let embedding = self
            .embeddings
            .embed_query(query, instance, &state.config.embedding_model)
            .await?;
        let raw = self
            .collections
            .backend()
            .query(&state.collection_name, &embedding, n_results)
            .await?;

        let mut hits = Vec::with_capacity(raw.len());
        for hit in raw {
            match meta_str(&hit.metadata, "instance_name") {
                Some(owner) if owner == instance => hits.push(to_search_hit(instance, hit)),
                owner => warn!(
                    instance = %instance,
                    chunk_id = %hit.id,
                    owner = owner.unwrap_or("<none>"),
                    "Dropping hit owned by another instance"
                ),
            }
        }
        Ok(hits)
    }

    /// Search every initialized instance and merge into one ranking.
    ///
    /// Instances whose search fails are logged and skipped.
    ///
    /// # Errors
    /// Returns `VectorStoreError::Query` for an invalid query
    pub async fn search_all_instances(
        &self,
        query: &str,
        n_results: usize,
    ) -> VectorStoreResult<Vec<SearchHit>> {
        SearchQuery::new(query, Some(n_results)).validate()?;
        let instances = self.list_instances();
        let lists = self.fan_out(&instances, query, n_results).await;
        Ok(merge_global(lists, n_results))
    }

    async fn fan_out(
        &self,
        instances: &[String],
        query: &str,
        n_results: usize,
    ) -> Vec<Vec<SearchHit>> {
        let results = join_all(
            instances
                .iter()
                .map(|instance| self.search_instance_papers(instance, query, n_results)),
        )
        .await;

        instances
            .iter()
            .zip(results)
            .filter_map(|(instance, result)| match result {
                Ok(hits) => Some(hits),
                Err(e) => {
                    warn!(instance = %instance, error = %e, "Instance search failed, skipping");
                    None
                }
            })
            .collect()
    }

    /// Papers similar to `reference` across instances, one hit per paper.
    ///
    /// # Arguments
    /// * `reference` - Paper whose title and abstract form the query
    /// * `n_results` - Maximum number of papers to return
    /// * `exclude_same_instance` - Skip the reference paper's own instance
    ///
    /// # Errors
    /// Returns `VectorStoreError::Query` if the paper has no usable text
    pub async fn find_similar_papers_across_instances(
        &self,
        reference: &Paper,
        n_results: usize,
        exclude_same_instance: bool,
    ) -> VectorStoreResult<Vec<SearchHit>> {
        let query = reference.similarity_text();
        SearchQuery::new(query.as_str(), Some(n_results)).validate()?;

        let instances: Vec<String> = self
            .list_instances()
            .into_iter()
            .filter(|i| !(exclude_same_instance && *i == reference.instance_name))
            .collect();

        // Several chunks of one paper usually match, so fetch more than needed
        let fetch = (n_results * 3).min(MAX_N_RESULTS);
        let hits: Vec<SearchHit> = self
            .fan_out(&instances, &query, fetch)
            .await
            .into_iter()
            .flatten()
            .filter(|hit| hit.paper_id != reference.id)
            .collect();

        Ok(merge_global(vec![best_per_paper(hits)], n_results))
    }

    /// # Errors
    /// Returns `VectorStoreError::UnknownInstance` or a backend failure
    pub async fn get_instance_stats(&self, instance: &str) -> VectorStoreResult<InstanceStats> {
        let state = self.state(instance)?;
        let collection = self.collections.get_collection_stats(instance).await?;
        Ok(InstanceStats {
            instance_name: instance.to_string(),
            config: state.config,
            dimension: state.dimension,
            initialized_at: state.initialized_at,
            collection,
        })
    }

    /// # Errors
    /// Returns `VectorStoreError::UnknownInstance` or a backend failure
    pub async fn validate_collection_integrity(
        &self,
        instance: &str,
    ) -> VectorStoreResult<IntegrityReport> {
        self.state(instance)?;
        Ok(self.collections.validate_collection_integrity(instance).await?)
    }

    /// Probe every instance's collection.
    pub async fn health_check(&self) -> HealthReport {
        let instances: Vec<(String, String)> = self
            .instances
            .read()
            .iter()
            .map(|(name, state)| (name.clone(), state.collection_name.clone()))
            .collect();

        let backend = self.collections.backend();
        let mut instance_health = BTreeMap::new();
        for (instance, collection) in instances {
            let health = match backend.count(&collection).await {
                Ok(count) => InstanceHealth {
                    status: HealthState::Healthy,
                    collection_name: collection,
                    chunk_count: Some(count),
                    error: None,
                },
                Err(e) => {
                    warn!(instance = %instance, error = %e, "Instance health probe failed");
                    InstanceHealth {
                        status: HealthState::Unhealthy,
                        collection_name: collection,
                        chunk_count: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            instance_health.insert(instance, health);
        }

        let total_instances = instance_health.len();
        let healthy_instances = instance_health
            .values()
            .filter(|h| h.status == HealthState::Healthy)
            .count();
        let overall_status = if healthy_instances == total_instances {
            HealthState::Healthy
        } else if healthy_instances == 0 {
            HealthState::Unhealthy
        } else {
            HealthState::Degraded
        };

        HealthReport {
            overall_status,
            total_instances,
            healthy_instances,
            instance_health,
            checked_at: Utc::now(),
        }
    }

    /// Scan every instance collection for records owned by another instance.
    ///
    /// # Errors
    /// Returns `VectorStoreError` if the backend cannot be read
    pub async fn validate_instance_separation(&self) -> VectorStoreResult<SeparationReport> {
        let mut issues = Vec::new();
        let mut cross_contamination = Vec::new();

        let present = self.collections.list_instance_collections().await?;
        for instance in self.list_instances() {
            if !present.iter().any(|c| c.instance_name == instance) {
                issues.push(format!("instance {} has no collection", instance));
            }
        }

        let backend = self.collections.backend();
        for summary in &present {
            for record in backend.get_all(&summary.collection_name).await? {
                let owner = meta_str(&record.metadata, "instance_name");
                if owner == Some(summary.instance_name.as_str()) {
                    continue;
                }
                issues.push(format!(
                    "record {} in {} is owned by {}",
                    record.id,
                    summary.collection_name,
                    owner.unwrap_or("<none>")
                ));
                cross_contamination.push(Contamination {
                    collection_instance: summary.instance_name.clone(),
                    record_id: record.id.clone(),
                    record_instance: owner.map(str::to_string),
                });
            }
        }

        if !issues.is_empty() {
            warn!(issues = issues.len(), "Instance separation check failed");
        }
        Ok(SeparationReport {
            separation_valid: issues.is_empty(),
            instances_checked: present.len(),
            issues,
            cross_contamination,
        })
    }
}

fn chunk_metadata(
    instance: &str,
    paper: &Paper,
    chunk: &Chunk,
    authors: &str,
    model: &str,
    added_at: &str,
) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("instance_name".into(), instance.into());
    metadata.insert("document_id".into(), chunk.document_id.clone().into());
    metadata.insert("paper_id".into(), paper.id.clone().into());
    metadata.insert("title".into(), paper.title.clone().into());
    metadata.insert("authors".into(), authors.into());
    metadata.insert("chunk_level".into(), json!(chunk.level));
    metadata.insert("chunk_index".into(), json!(chunk.index));
    metadata.insert(
        "parent_chunk_id".into(),
        chunk.parent_chunk_id.clone().map_or(Value::Null, Value::String),
    );
    metadata.insert("child_chunk_ids".into(), json!(chunk.child_chunk_ids));
    metadata.insert("has_overlap".into(), json!(chunk.has_overlap()));
    metadata.insert("overlap_start".into(), json!(chunk.overlap_start));
    metadata.insert("overlap_end".into(), json!(chunk.overlap_end));
    metadata.insert("embedding_model".into(), model.into());
    metadata.insert("source".into(), paper.source.clone().into());
    metadata.insert("added_at".into(), added_at.into());
    metadata
}

fn to_search_hit(instance: &str, hit: QueryHit) -> SearchHit {
    let paper_id = meta_str(&hit.metadata, "paper_id").unwrap_or_default().to_string();
    let title = meta_str(&hit.metadata, "title").unwrap_or_default().to_string();
    let chunk_level = hit.metadata.get("chunk_level").and_then(Value::as_u64).unwrap_or(0) as usize;
    SearchHit {
        chunk_id: hit.id,
        content: hit.document,
        instance_name: instance.to_string(),
        paper_id,
        title,
        chunk_level,
        relevance_score: hit.similarity,
        relevance: RelevanceLevel::from_score(hit.similarity),
        global_rank: None,
        metadata: hit.metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DefaultModelLoader;
    use crate::storage::{InMemoryVectorBackend, VectorBackend};

    const AI_TEXT_1: &str = "The transformer architecture relies entirely on attention. \
        Self-attention relates positions of a sequence to compute a representation.";
    const AI_TEXT_2: &str = "Machine learning models based on attention outperform \
        recurrent networks. Training the transformer is faster on parallel hardware.";
    const QUANT_TEXT_1: &str = "Stochastic volatility models capture clustering in equity returns. \
        Option prices depend on the volatility surface.";
    const QUANT_TEXT_2: &str = "Machine learning methods forecast realized volatility \
        from intraday data. Portfolio risk is estimated with factor models.";

    fn store() -> (MultiInstanceVectorStore, Arc<InMemoryVectorBackend>) {
        let backend = Arc::new(InMemoryVectorBackend::new());
        let collections = CollectionManager::new(backend.clone());
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(DefaultModelLoader::default())));
        (MultiInstanceVectorStore::new(collections, embeddings), backend)
    }

    fn chunk(document_id: &str, index: usize, content: &str) -> Chunk {
        Chunk {
            id: Chunk::chunk_id(document_id, 0, index),
            document_id: document_id.to_string(),
            content: content.to_string(),
            level: 0,
            index,
            parent_chunk_id: None,
            child_chunk_ids: Vec::new(),
            start_offset: 0,
            end_offset: content.len(),
            overlap_start: 0,
            overlap_end: 0,
            sentence_boundaries: vec![content.len()],
            metadata: BTreeMap::new(),
        }
    }

    async fn populated() -> (MultiInstanceVectorStore, Arc<InMemoryVectorBackend>) {
        let (store, backend) = store();
        store
            .initialize_instance("ai_scholar", InstanceConfig::new("hash-384", 1000))
            .await
            .unwrap();
        store
            .initialize_instance("quant_scholar", InstanceConfig::new("hash-384", 800))
            .await
            .unwrap();

        let ai = Paper::new("1706.03762", "Attention Is All You Need")
            .with_instance("ai_scholar")
            .with_abstract("The dominant sequence transduction models are based on attention.");
        let quant =
            Paper::new("quant-001", "Volatility Forecasting").with_instance("quant_scholar");

        let outcome = store
            .add_instance_document(
                "ai_scholar",
                &ai,
                &[chunk(&ai.id, 0, AI_TEXT_1), chunk(&ai.id, 1, AI_TEXT_2)],
            )
            .await
            .unwrap();
        assert_eq!(outcome.chunks_added, 2);
        assert_eq!(outcome.collection_name, "scholar_instance_ai_scholar_papers");

        store
            .add_instance_document(
                "quant_scholar",
                &quant,
                &[chunk(&quant.id, 0, QUANT_TEXT_1), chunk(&quant.id, 1, QUANT_TEXT_2)],
            )
            .await
            .unwrap();
        (store, backend)
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_different_instances_stay_separate() {
        let (store, _) = store();
        store
            .initialize_instance("ai_scholar", InstanceConfig::new("hash-384", 1000))
            .await
            .unwrap();
        store
            .initialize_instance("quant_scholar", InstanceConfig::new("hash-384", 800))
            .await
            .unwrap();

        let mut papers = Vec::new();
        for i in 0..20 {
            papers.push((
                "ai_scholar",
                Paper::new(format!("ai-{}", i), format!("Attention study {}", i))
                    .with_instance("ai_scholar"),
                AI_TEXT_1,
                AI_TEXT_2,
            ));
            papers.push((
                "quant_scholar",
                Paper::new(format!("quant-{}", i), format!("Volatility study {}", i))
                    .with_instance("quant_scholar"),
                QUANT_TEXT_1,
                QUANT_TEXT_2,
            ));
        }

        let store_ref = &store;
        let outcomes = join_all(papers.iter().map(|(instance, paper, first, second)| async move {
            let chunks = [chunk(&paper.id, 0, first), chunk(&paper.id, 1, second)];
            store_ref.add_instance_document(instance, paper, &chunks).await
        }))
        .await;
        assert!(outcomes.iter().all(|o| matches!(o, Ok(added) if added.chunks_added == 2)));

        let separation = store.validate_instance_separation().await.unwrap();
        assert!(separation.separation_valid, "{:?}", separation.issues);
        assert!(separation.cross_contamination.is_empty());

        for instance in ["ai_scholar", "quant_scholar"] {
            let stats = store.get_instance_stats(instance).await.unwrap();
            assert_eq!(stats.collection.chunk_count, 40);
            assert_eq!(stats.collection.paper_count, 20);

            let hits = store
                .search_instance_papers(instance, "machine learning", 50)
                .await
                .unwrap();
            assert!(!hits.is_empty());
            assert!(hits.iter().all(|h| h.instance_name == instance));
            assert!(hits.iter().all(|h| h.paper_id.starts_with(&instance[..2])));
        }
    }

    #[tokio::test]
    async fn test_end_to_end_isolation_and_global_ranking() {
        let (store, _) = populated().await;

        let hits = store
            .search_instance_papers("ai_scholar", "attention transformer", 5)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.instance_name == "ai_scholar"));
        assert!(hits.iter().all(|h| h.metadata["instance_name"] == "ai_scholar"));

        let global = store.search_all_instances("machine learning", 5).await.unwrap();
        assert!(global.iter().any(|h| h.instance_name == "ai_scholar"));
        assert!(global.iter().any(|h| h.instance_name == "quant_scholar"));
        let ranks: Vec<usize> = global.iter().filter_map(|h| h.global_rank).collect();
        assert_eq!(ranks.len(), global.len());
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ranks[0], 1);
    }

    #[tokio::test]
    async fn test_metadata_written_with_chunks() {
        let (store, backend) = populated().await;
        let records = backend.get_all("scholar_instance_ai_scholar_papers").await.unwrap();
        assert_eq!(records.len(), 2);
        let meta = &records[0].metadata;
        for key in [
            "instance_name",
            "document_id",
            "paper_id",
            "title",
            "authors",
            "chunk_level",
            "chunk_index",
            "parent_chunk_id",
            "child_chunk_ids",
            "has_overlap",
            "overlap_start",
            "overlap_end",
            "embedding_model",
            "source",
            "added_at",
        ] {
            assert!(meta.contains_key(key), "missing {key}");
        }
        assert_eq!(meta["embedding_model"], "hash-384");

        let stats = store.get_instance_stats("ai_scholar").await.unwrap();
        assert_eq!(stats.collection.chunk_count, 2);
        assert_eq!(stats.collection.paper_count, 1);
        assert_eq!(stats.dimension, 384);
    }

    #[tokio::test]
    async fn test_rejects_cross_instance_writes() {
        let (store, _) = populated().await;
        let foreign = Paper::new("quant-002", "Foreign").with_instance("quant_scholar");
        let err = store
            .add_instance_document("ai_scholar", &foreign, &[chunk("quant-002", 0, "text body")])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::InstanceMismatch { .. }));

        let paper = Paper::new("p2", "Mine").with_instance("ai_scholar");
        let err = store
            .add_instance_document("ai_scholar", &paper, &[chunk("other", 0, "text body")])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::DocumentMismatch { .. }));

        let err = store.add_instance_document("ai_scholar", &paper, &[]).await.unwrap_err();
        assert!(matches!(err, VectorStoreError::EmptyDocument(_)));

        let err = store
            .search_instance_papers("unknown_scholar", "attention", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::UnknownInstance(_)));
    }

    #[tokio::test]
    async fn test_contaminated_hits_are_dropped_and_reported() {
        let (store, backend) = populated().await;
        let mut metadata = Metadata::new();
        metadata.insert("instance_name".into(), "quant_scholar".into());
        metadata.insert("paper_id".into(), "leak".into());
        backend
            .add(
                "scholar_instance_ai_scholar_papers",
                vec![VectorRecord {
                    id: "leak_L0_C0".to_string(),
                    document: "attention transformer".to_string(),
                    metadata,
                    embedding: store
                        .embeddings()
                        .embed_query("attention transformer", "ai_scholar", "hash-384")
                        .await
                        .unwrap(),
                }],
            )
            .await
            .unwrap();

        let hits = store
            .search_instance_papers("ai_scholar", "attention transformer", 10)
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.chunk_id != "leak_L0_C0"));

        let report = store.validate_instance_separation().await.unwrap();
        assert!(!report.separation_valid);
        assert_eq!(report.cross_contamination.len(), 1);
        assert_eq!(report.cross_contamination[0].record_instance.as_deref(), Some("quant_scholar"));
    }

    #[tokio::test]
    async fn test_clean_separation_and_health() {
        let (store, _) = populated().await;
        let report = store.validate_instance_separation().await.unwrap();
        assert!(report.separation_valid, "{:?}", report.issues);
        assert_eq!(report.instances_checked, 2);

        let health = store.health_check().await;
        assert_eq!(health.overall_status, HealthState::Healthy);
        assert_eq!(health.total_instances, 2);
        assert_eq!(health.healthy_instances, 2);
        assert_eq!(health.instance_health["ai_scholar"].chunk_count, Some(2));
    }

    #[tokio::test]
    async fn test_health_degrades_when_collection_disappears() {
        let (store, backend) = populated().await;
        backend
            .delete_collection("scholar_instance_quant_scholar_papers")
            .await
            .unwrap();
        let health = store.health_check().await;
        assert_eq!(health.overall_status, HealthState::Degraded);
        assert_eq!(health.instance_health["quant_scholar"].status, HealthState::Unhealthy);

        let global = store.search_all_instances("machine learning", 5).await.unwrap();
        assert!(global.iter().all(|h| h.instance_name == "ai_scholar"));
    }

    #[tokio::test]
    async fn test_find_similar_excludes_reference() {
        let (store, _) = populated().await;
        let reference = Paper::new("1706.03762", "Attention Is All You Need")
            .with_instance("ai_scholar")
            .with_abstract("Machine learning with attention");

        let similar = store
            .find_similar_papers_across_instances(&reference, 5, false)
            .await
            .unwrap();
        assert!(similar.iter().all(|h| h.paper_id != reference.id));
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].instance_name, "quant_scholar");
        assert_eq!(similar[0].global_rank, Some(1));

        let excluded = store
            .find_similar_papers_across_instances(&reference, 5, true)
            .await
            .unwrap();
        assert!(excluded.iter().all(|h| h.instance_name != "ai_scholar"));
    }

    #[tokio::test]
    async fn test_add_paper_text_chunks_with_instance_settings() {
        let (store, _) = store();
        store
            .initialize_instance("ai_scholar", InstanceConfig::new("hash-64", 200))
            .await
            .unwrap();
        let paper = Paper::new("long-paper", "Long").with_instance("ai_scholar");
        let text = "Attention layers mix information across tokens. ".repeat(20);
        let outcome = store.add_paper_text("ai_scholar", &paper, &text).await.unwrap();
        assert!(outcome.chunks_added > 2);

        let report = store.validate_collection_integrity("ai_scholar").await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
    }

    #[tokio::test]
    async fn test_initialize_validates_name_and_config() {
        let (store, _) = store();
        assert!(matches!(
            store.initialize_instance("admin", InstanceConfig::default()).await,
            Err(VectorStoreError::Collection(_))
        ));
        let mut bad = InstanceConfig::new("hash-64", 1000);
        bad.chunk_overlap = 900;
        assert!(matches!(
            store.initialize_instance("ai_scholar", bad).await,
            Err(VectorStoreError::InvalidConfig(_))
        ));
        assert!(store.list_instances().is_empty());

        store
            .initialize_instance("ai_scholar", InstanceConfig::new("hash-64", 1000))
            .await
            .unwrap();
        assert!(store.remove_instance("ai_scholar", true).await.unwrap());
        assert!(store.list_instances().is_empty());
        assert!(!store
            .collections()
            .backend()
            .collection_exists("scholar_instance_ai_scholar_papers")
            .await
            .unwrap());
    }
}
