//! Process-wide wiring.
//!
//! [`ScholarContext`] owns the long-lived components (storage, embedding
//! service, vector store, resilience state) built from an [`AppConfig`].
//! Binaries create one at startup with [`ScholarContext::init`] and hand it
//! to the server or downloader; [`ScholarContext::close`] writes the final
//! error report.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::collection::CollectionManager;
use crate::config::{default_cache_dir, AppConfig, ConfigError, StorageBackendKind};
use crate::embedding::{DefaultModelLoader, EmbeddingService};
use crate::extraction::DocumentExtractor;
use crate::ingestion::{DownloaderConfig, ScholarDownloader};
use crate::provider::{PaperSource, ProviderError};
use crate::resilience::classifier::ReportError;
use crate::resilience::{CircuitBreakers, ErrorClassifier, ErrorReport, ResilientRunner};
use crate::storage::{
    InMemoryMetadataStore, InMemoryVectorBackend, JsonMetadataStore, MetadataStore,
    SqliteVectorBackend, StorageError, VectorBackend,
};
use crate::vector_store::{MultiInstanceVectorStore, VectorStoreError};

/// Errors raised while setting up or tearing down the context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("Paper source error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Instance not configured: {0}")]
    UnknownInstance(String),
}

/// Result type for context operations.
pub type ContextResult<T> = Result<T, ContextError>;

/// Shared components of a running process.
pub struct ScholarContext {
    config: AppConfig,
    store: Arc<MultiInstanceVectorStore>,
    metadata: Arc<dyn MetadataStore>,
    runner: ResilientRunner,
}

impl ScholarContext {
    /// Build every component and initialize the configured instances.
    ///
    /// # Errors
    /// Returns `ContextError` if the configuration is invalid, storage cannot
    /// be opened, or an instance fails to initialize
    pub async fn init(config: AppConfig) -> ContextResult<Self> {
        config.validate()?;

        let backend: Arc<dyn VectorBackend> = match config.storage.backend {
            StorageBackendKind::Memory => Arc::new(InMemoryVectorBackend::new()),
            StorageBackendKind::Sqlite => {
                Arc::new(SqliteVectorBackend::open(&config.storage.sqlite_path)?)
            }
        };
        let metadata: Arc<dyn MetadataStore> = match &config.storage.metadata_dir {
            Some(dir) => Arc::new(JsonMetadataStore::new(dir.clone())),
            None => Arc::new(InMemoryMetadataStore::new()),
        };

        let loader = DefaultModelLoader {
            openai_api_key: config.embedding.openai_api_key.clone(),
            openai_base_url: config.embedding.openai_base_url.clone(),
            cache_dir: Some(config.embedding.cache_dir.clone().unwrap_or_else(default_cache_dir)),
        };
        let embeddings = Arc::new(EmbeddingService::with_batch_size(
            Arc::new(loader),
            config.embedding.batch_size,
        ));
        let store = Arc::new(MultiInstanceVectorStore::new(
            CollectionManager::new(backend),
            embeddings,
        ));

        let runner = ResilientRunner::new(
            config.resilience.retry.clone(),
            Arc::new(CircuitBreakers::new(config.resilience.circuit_breaker.clone())),
            Arc::new(ErrorClassifier::new(config.resilience.classifier.clone())),
        );

        for (name, instance_config) in config.instance_configs() {
            store.initialize_instance(&name, instance_config).await?;
        }

        info!(
            backend = ?config.storage.backend,
            instances = config.instances.len(),
            "Scholar context initialized"
        );
        Ok(Self {
            config,
            store,
            metadata,
            runner,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MultiInstanceVectorStore> {
        &self.store
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn runner(&self) -> &ResilientRunner {
        &self.runner
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        self.runner.classifier()
    }

    /// Build the configured paper source.
    ///
    /// # Errors
    /// Returns `ContextError::Provider` if the source cannot be set up
    pub fn source(&self) -> ContextResult<Arc<dyn PaperSource>> {
        Ok(self.config.downloader.source.build(&self.config.downloader.http)?)
    }

    /// Downloader for a configured instance, using the configured source.
    ///
    /// # Arguments
    /// * `instance` - Name of an `[[instances]]` entry
    /// * `max_papers` - Discovery limit; the configured default when `None`
    ///
    /// # Errors
    /// Returns `ContextError::UnknownInstance` for an unconfigured instance,
    /// or `ContextError::Provider` if the source cannot be built
    pub fn downloader_for(
        &self,
        instance: &str,
        max_papers: Option<usize>,
    ) -> ContextResult<ScholarDownloader> {
        let entry = self
            .config
            .instance(instance)
            .ok_or_else(|| ContextError::UnknownInstance(instance.to_string()))?;
        let settings = &self.config.downloader;

        let mut downloader_config = DownloaderConfig::new(instance);
        downloader_config.categories = entry.categories.clone();
        downloader_config.max_papers = max_papers.unwrap_or(settings.max_papers);
        downloader_config.max_concurrent_downloads = settings.max_concurrent_downloads;
        downloader_config.batch_size = settings.batch_size;
        downloader_config.date_from = settings.date_from;
        downloader_config.date_to = settings.date_to;

        Ok(ScholarDownloader::new(
            self.source()?,
            Arc::clone(&self.store),
            Arc::clone(&self.metadata),
            self.runner.clone(),
            Arc::new(DocumentExtractor::new(settings.min_text_len)),
            downloader_config,
        ))
    }

    /// Log final health and write the error report, if a path is configured.
    ///
    /// # Errors
    /// Returns `ContextError::Report` if the report cannot be written
    pub async fn close(self) -> ContextResult<Option<ErrorReport>> {
        let stats = self.classifier().stats();
        info!(
            health = %self.classifier().health_status().as_str(),
            total_errors = stats.total_errors,
            total_successes = stats.total_successes,
            "Shutting down scholar context"
        );
        match &self.config.resilience.report_path {
            Some(path) => Ok(Some(self.classifier().export_report(path).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceEntry;
    use chrono::NaiveDate;
    use crate::models::Paper;
    use crate::provider::SourceKind;

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackendKind::Memory;
        config.storage.metadata_dir = None;
        config.instances = vec![
            InstanceEntry {
                name: "ai_scholar".to_string(),
                categories: vec!["cs.AI".to_string()],
                ..InstanceEntry::default()
            },
            InstanceEntry {
                name: "quant_scholar".to_string(),
                chunk_size: Some(800),
                ..InstanceEntry::default()
            },
        ];
        config
    }

    #[tokio::test]
    async fn test_init_registers_instances() {
        let context = ScholarContext::init(memory_config()).await.unwrap();
        assert_eq!(context.store().list_instances(), vec!["ai_scholar", "quant_scholar"]);
        assert_eq!(context.store().instance_config("quant_scholar").unwrap().chunk_size, 800);

        let downloader = context.downloader_for("ai_scholar", Some(5)).unwrap();
        assert_eq!(downloader.config().max_papers, 5);
        assert_eq!(downloader.config().categories, vec!["cs.AI"]);
        assert!(matches!(
            context.downloader_for("bio_scholar", None),
            Err(ContextError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn test_downloader_inherits_date_window() {
        let mut config = memory_config();
        config.downloader.date_from = NaiveDate::from_ymd_opt(2023, 1, 1);
        config.downloader.date_to = NaiveDate::from_ymd_opt(2023, 12, 31);
        let context = ScholarContext::init(config).await.unwrap();

        let downloader = context.downloader_for("quant_scholar", None).unwrap();
        assert_eq!(downloader.config().date_from, NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(downloader.config().date_to, NaiveDate::from_ymd_opt(2023, 12, 31));
        downloader.config().validate().unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_and_json_storage_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config();
        config.storage.backend = StorageBackendKind::Sqlite;
        config.storage.sqlite_path = dir.path().join("vectors.db");
        config.storage.metadata_dir = Some(dir.path().join("papers"));

        {
            let context = ScholarContext::init(config.clone()).await.unwrap();
            let paper = Paper::new("1706.03762", "Attention Is All You Need")
                .with_instance("ai_scholar");
            context
                .store()
                .add_paper_text(
                    "ai_scholar",
                    &paper,
                    "Attention is all you need. Transformers work.",
                )
                .await
                .unwrap();
            context.metadata().save(&paper).await.unwrap();
        }

        let context = ScholarContext::init(config).await.unwrap();
        let stats = context.store().get_instance_stats("ai_scholar").await.unwrap();
        assert!(stats.collection.chunk_count >= 1);
        assert!(context.metadata().exists("ai_scholar", "1706.03762").await.unwrap());
    }

    #[tokio::test]
    async fn test_close_exports_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config();
        let report_path = dir.path().join("reports").join("errors.json");
        config.resilience.report_path = Some(report_path.clone());

        let context = ScholarContext::init(config).await.unwrap();
        let report = context.close().await.unwrap().unwrap();
        assert_eq!(report.summary.stats.total_errors, 0);
        assert!(report_path.exists());
    }

    #[tokio::test]
    async fn test_source_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = memory_config();
        config.downloader.source = SourceKind::JsonFile {
            path: dir.path().join("papers.json"),
        };
        let context = ScholarContext::init(config).await.unwrap();
        assert_eq!(context.source().unwrap().name(), "json_file");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = memory_config();
        config.instances[0].name = "system".to_string();
        assert!(matches!(ScholarContext::init(config).await, Err(ContextError::Config(_))));
    }
}
