//! Scholar downloader.
//!
//! Drives one ingestion run for one instance:
//!
//! 1. Discover candidate papers through the configured [`PaperSource`]
//! 2. Skip papers already in the metadata store, and repeats within the listing
//! 3. Process the rest in batches, at most `max_concurrent_downloads` at a time:
//!    download, extract text, chunk and embed into the instance's collection,
//!    then save the paper's metadata
//!
//! Every step runs under the [`ResilientRunner`] with its own category, so a
//! failing paper is retried, recorded and skipped without aborting the batch.
//! After each batch the classifier decides whether the run may continue.
//!
//! ```ignore
//! let downloader = ScholarDownloader::new(source, store, metadata, runner, extractor, config)
//!     .with_progress(Arc::new(|p: &DownloadProgress| println!("{}/{}", p.processed, p.total)));
//! let stats = downloader.run().await?;
//! println!("{} papers, {} chunks", stats.successful, stats.total_chunks);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::collection::{validate_instance_name, CollectionError};
use crate::extraction::TextExtractor;
use crate::models::Paper;
use crate::provider::{DiscoveryQuery, PaperSource};
use crate::resilience::{
    ErrorCategory, ErrorReport, OperationContext, OperationError, ResilientRunner, RunError,
};
use crate::storage::MetadataStore;
use crate::vector_store::MultiInstanceVectorStore;

/// Errors that abort an ingestion run.
///
/// Per-paper failures never surface here; they are collected in
/// [`DownloadStats::failures`].
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Invalid downloader configuration
    #[error("Invalid downloader configuration: {0}")]
    InvalidConfig(String),

    /// Target instance is not initialized in the store
    #[error("Instance not initialized: {0}")]
    UnknownInstance(String),

    /// Discovery failed after retries
    #[error("Discovery failed: {0}")]
    Discovery(RunError),

    /// The run was cancelled
    #[error("Ingestion cancelled")]
    Cancelled,
}

/// Result type for ingestion operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

impl From<CollectionError> for IngestionError {
    fn from(err: CollectionError) -> Self {
        IngestionError::InvalidConfig(err.to_string())
    }
}

/// Settings for one downloader run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Instance the papers are ingested into
    pub instance_name: String,

    /// Source categories to discover; empty means all
    #[serde(default)]
    pub categories: Vec<String>,

    /// Maximum number of papers to discover
    #[serde(default = "default_max_papers")]
    pub max_papers: usize,

    /// Papers processed concurrently within a batch
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Papers per batch; health is checked between batches
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub date_from: Option<NaiveDate>,

    #[serde(default)]
    pub date_to: Option<NaiveDate>,
}

fn default_max_papers() -> usize {
    100
}

fn default_max_concurrent() -> usize {
    3
}

fn default_batch_size() -> usize {
    10
}

impl DownloaderConfig {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            categories: Vec::new(),
            max_papers: default_max_papers(),
            max_concurrent_downloads: default_max_concurrent(),
            batch_size: default_batch_size(),
            date_from: None,
            date_to: None,
        }
    }

    pub fn with_categories(mut self, categories: &[&str]) -> Self {
        self.categories = categories.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_max_papers(mut self, max_papers: usize) -> Self {
        self.max_papers = max_papers;
        self
    }

    /// # Errors
    /// Returns `IngestionError::InvalidConfig` for a bad instance name, zero
    /// concurrency or batch size, or an inverted date range
    pub fn validate(&self) -> IngestionResult<()> {
        validate_instance_name(&self.instance_name)?;
        if self.max_concurrent_downloads == 0 {
            return Err(IngestionError::InvalidConfig(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(IngestionError::InvalidConfig("batch_size must be at least 1".to_string()));
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(IngestionError::InvalidConfig(format!(
                    "date_from {} is after date_to {}",
                    from, to
                )));
            }
        }
        Ok(())
    }

    fn discovery_query(&self) -> DiscoveryQuery {
        DiscoveryQuery {
            categories: self.categories.clone(),
            max_results: self.max_papers,
            date_from: self.date_from,
            date_to: self.date_to,
        }
    }
}

/// Step of the per-paper pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    DuplicateCheck,
    Download,
    Extraction,
    Indexing,
    Metadata,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::DuplicateCheck => "duplicate_check",
            PipelineStage::Download => "download",
            PipelineStage::Extraction => "extraction",
            PipelineStage::Indexing => "indexing",
            PipelineStage::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A paper that could not be ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPaper {
    pub paper_id: String,
    pub title: String,

    /// Step that failed
    pub stage: PipelineStage,

    /// Category of the final failure, if one applies
    pub category: Option<ErrorCategory>,

    pub error: String,
}

/// Counters reported to the progress callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Papers to process after deduplication
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Callback invoked after every processed paper.
pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

/// Final statistics of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadStats {
    pub instance_name: String,

    /// Papers returned by discovery
    pub discovered: usize,

    /// Papers skipped as already stored or repeated in the listing
    pub duplicates: usize,

    pub processed: usize,
    pub successful: usize,
    pub failed: usize,

    /// Chunks written across all successful papers
    pub total_chunks: usize,

    pub failures: Vec<FailedPaper>,

    pub elapsed_secs: f64,

    /// Whether the run stopped early on the classifier's verdict
    pub halted: bool,

    /// Health report captured when the run halted
    pub health_report: Option<ErrorReport>,
}

impl DownloadStats {
    /// Fraction of processed papers that succeeded; 0 when none were processed.
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.successful as f64 / self.processed as f64
    }

    /// Processed papers per second.
    pub fn throughput(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.processed as f64 / self.elapsed_secs
    }

    fn progress(&self, total: usize) -> DownloadProgress {
        DownloadProgress {
            total,
            processed: self.processed,
            successful: self.successful,
            failed: self.failed,
        }
    }
}

/// Handle that cancels a running downloader from another task.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), OperationError> {
        if self.is_cancelled() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Papers left to process after duplicate checks, and failed lookups.
struct Deduplicated {
    pending: Vec<Paper>,
    failures: Vec<FailedPaper>,
}

enum PaperOutcome {
    Stored { chunks: usize },
    Failed(FailedPaper),
    Cancelled,
}

fn failure(paper: &Paper, stage: PipelineStage, err: RunError) -> PaperOutcome {
    match err {
        RunError::Cancelled => PaperOutcome::Cancelled,
        other => PaperOutcome::Failed(FailedPaper {
            paper_id: paper.id.clone(),
            title: paper.title.clone(),
            stage,
            category: other.category(),
            error: other.to_string(),
        }),
    }
}

/// Downloads, indexes and records papers for one instance.
pub struct ScholarDownloader {
    source: Arc<dyn PaperSource>,
    store: Arc<MultiInstanceVectorStore>,
    metadata: Arc<dyn MetadataStore>,
    runner: ResilientRunner,
    extractor: Arc<dyn TextExtractor>,
    config: DownloaderConfig,
    progress: Option<ProgressCallback>,
    cancel: CancelHandle,
}

impl ScholarDownloader {
    pub fn new(
        source: Arc<dyn PaperSource>,
        store: Arc<MultiInstanceVectorStore>,
        metadata: Arc<dyn MetadataStore>,
        runner: ResilientRunner,
        extractor: Arc<dyn TextExtractor>,
        config: DownloaderConfig,
    ) -> Self {
        Self {
            source,
            store,
            metadata,
            runner,
            extractor,
            config,
            progress: None,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    pub fn runner(&self) -> &ResilientRunner {
        &self.runner
    }

    /// Handle that cancels this downloader's runs.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn context(&self, operation: &str) -> OperationContext {
        OperationContext::new(operation)
            .with_instance(&self.config.instance_name)
            .with_field("source", self.source.name())
    }

    /// Run discovery and ingest every new paper.
    ///
    /// # Returns
    /// Statistics of the run; failed papers are listed, not raised
    ///
    /// # Errors
    /// - `IngestionError::InvalidConfig` / `UnknownInstance` before any work
    /// - `IngestionError::Discovery` if the listing cannot be fetched
    /// - `IngestionError::Cancelled` once the cancel handle fires
    pub async fn run(&self) -> IngestionResult<DownloadStats> {
        self.config.validate()?;
        let instance = self.config.instance_name.as_str();
        if self.store.instance_config(instance).is_none() {
            return Err(IngestionError::UnknownInstance(instance.to_string()));
        }

        let started = Instant::now();
        let mut stats = DownloadStats {
            instance_name: instance.to_string(),
            ..DownloadStats::default()
        };

        let discovered = self.discover().await?;
        stats.discovered = discovered.len();
        info!(
            instance = %instance,
            source = %self.source.name(),
            discovered = stats.discovered,
            "Discovery complete"
        );

        let Deduplicated { pending, failures } = self.deduplicate(discovered, &mut stats).await?;
        let total = pending.len() + failures.len();
        info!(
            instance = %instance,
            pending = pending.len(),
            duplicates = stats.duplicates,
            "Starting ingestion"
        );

        let lookup_failed = !failures.is_empty();
        for failed in failures {
            warn!(
                instance = %instance,
                paper_id = %failed.paper_id,
                stage = %failed.stage,
                "Paper failed: {}",
                failed.error
            );
            self.record_failure(&mut stats, failed, total);
        }
        if lookup_failed && !self.runner.classifier().should_continue_processing() {
            self.halt(&mut stats);
            stats.elapsed_secs = started.elapsed().as_secs_f64();
            return Ok(stats);
        }

        for batch in pending.chunks(self.config.batch_size) {
            if self.cancel.is_cancelled() {
                return Err(IngestionError::Cancelled);
            }

            let mut outcomes = stream::iter(batch.iter().map(|paper| self.process_paper(paper)))
                .buffer_unordered(self.config.max_concurrent_downloads);

            while let Some((paper_id, outcome)) = outcomes.next().await {
                match outcome {
                    PaperOutcome::Stored { chunks } => {
                        stats.successful += 1;
                        stats.total_chunks += chunks;
                        stats.processed += 1;
                        debug!(
                            instance = %instance,
                            paper_id = %paper_id,
                            chunks,
                            "Paper ingested"
                        );
                        self.report_progress(&stats, total);
                    }
                    PaperOutcome::Failed(failed) => {
                        warn!(
                            instance = %instance,
                            paper_id = %paper_id,
                            stage = %failed.stage,
                            "Paper failed: {}",
                            failed.error
                        );
                        self.record_failure(&mut stats, failed, total);
                    }
                    PaperOutcome::Cancelled => {
                        info!(instance = %instance, "Ingestion cancelled");
                        return Err(IngestionError::Cancelled);
                    }
                }
            }

            if !self.runner.classifier().should_continue_processing() {
                self.halt(&mut stats);
                break;
            }
        }

        stats.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            instance = %instance,
            successful = stats.successful,
            failed = stats.failed,
            chunks = stats.total_chunks,
            success_rate = stats.success_rate(),
            "Ingestion finished"
        );
        Ok(stats)
    }

    async fn discover(&self) -> IngestionResult<Vec<Paper>> {
        let query = self.config.discovery_query();
        let category = self.source.category();
        let source = &self.source;
        let cancel = &self.cancel;
        let query_ref = &query;

        let papers = self
            .runner
            .run_with_retry(category, &self.context("discover_papers"), || async move {
                cancel.check()?;
                source
                    .discover(query_ref)
                    .await
                    .map_err(|e| e.into_operation_error(category))
            })
            .await
            .map_err(|e| match e {
                RunError::Cancelled => IngestionError::Cancelled,
                other => IngestionError::Discovery(other),
            })?;

        let instance = &self.config.instance_name;
        Ok(papers
            .into_iter()
            .take(self.config.max_papers)
            .map(|paper| paper.with_instance(instance.as_str()))
            .collect())
    }

    fn report_progress(&self, stats: &DownloadStats, total: usize) {
        if let Some(callback) = &self.progress {
            callback(&stats.progress(total));
        }
    }

    fn record_failure(&self, stats: &mut DownloadStats, failed: FailedPaper, total: usize) {
        stats.processed += 1;
        stats.failed += 1;
        stats.failures.push(failed);
        self.report_progress(stats, total);
    }

    fn halt(&self, stats: &mut DownloadStats) {
        let report = self.runner.classifier().build_report();
        warn!(
            instance = %self.config.instance_name,
            health = %report.summary.health_status.as_str(),
            processed = stats.processed,
            "Halting ingestion on error threshold"
        );
        stats.halted = true;
        stats.health_report = Some(report);
    }

    /// Drop repeats within the listing and papers already recorded.
    ///
    /// A failed lookup marks the paper failed rather than guessing. Lookups
    /// stop early once the classifier says processing should not continue.
    async fn deduplicate(
        &self,
        discovered: Vec<Paper>,
        stats: &mut DownloadStats,
    ) -> IngestionResult<Deduplicated> {
        let instance = self.config.instance_name.as_str();
        let metadata = &self.metadata;
        let cancel = &self.cancel;
        let mut seen = HashSet::new();
        let mut pending = Vec::with_capacity(discovered.len());
        let mut failures = Vec::new();

        for paper in discovered {
            if !seen.insert(paper.id.clone()) {
                stats.duplicates += 1;
                continue;
            }

            let paper_id = paper.id.as_str();
            let ctx = self.context("check_duplicate").with_paper(paper_id);
            let exists = self
                .runner
                .run_with_retry(ErrorCategory::Storage, &ctx, || async move {
                    cancel.check()?;
                    metadata.exists(instance, paper_id).await.map_err(OperationError::from)
                })
                .await;

            match exists {
                Ok(true) => stats.duplicates += 1,
                Ok(false) => pending.push(paper),
                Err(RunError::Cancelled) => return Err(IngestionError::Cancelled),
                Err(err) => {
                    let outcome = failure(&paper, PipelineStage::DuplicateCheck, err);
                    if let PaperOutcome::Failed(failed) = outcome {
                        failures.push(failed);
                    }
                    if !self.runner.classifier().should_continue_processing() {
                        warn!(
                            instance = %instance,
                            failed_lookups = failures.len(),
                            "Stopping duplicate checks on error threshold"
                        );
                        break;
                    }
                }
            }
        }
        Ok(Deduplicated { pending, failures })
    }

    async fn process_paper(&self, paper: &Paper) -> (String, PaperOutcome) {
        let outcome = self.ingest_paper(paper).await;
        (paper.id.clone(), outcome)
    }

    async fn ingest_paper(&self, paper: &Paper) -> PaperOutcome {
        let instance = self.config.instance_name.as_str();
        let cancel = &self.cancel;

        let source = &self.source;
        let source_category = source.category();
        let ctx = self.context("download_paper").with_paper(&paper.id);
        let content = match self
            .runner
            .run_with_retry(source_category, &ctx, || async move {
                cancel.check()?;
                source
                    .download(paper)
                    .await
                    .map_err(|e| e.into_operation_error(source_category))
            })
            .await
        {
            Ok(content) => content,
            Err(err) => return failure(paper, PipelineStage::Download, err),
        };

        let extractor = &self.extractor;
        let content_ref = &content;
        let ctx = self.context("extract_text").with_paper(&paper.id);
        let text = match self
            .runner
            .run_with_retry(ErrorCategory::PdfProcessing, &ctx, || async move {
                cancel.check()?;
                extractor.extract(content_ref).await.map_err(OperationError::from)
            })
            .await
        {
            Ok(text) => text,
            Err(err) => return failure(paper, PipelineStage::Extraction, err),
        };

        let store = &self.store;
        let text_ref = text.as_str();
        let ctx = self.context("index_chunks").with_paper(&paper.id);
        let added = match self
            .runner
            .run_with_retry(ErrorCategory::VectorStore, &ctx, || async move {
                cancel.check()?;
                store
                    .add_paper_text(instance, paper, text_ref)
                    .await
                    .map_err(OperationError::from)
            })
            .await
        {
            Ok(added) => added,
            Err(err) => return failure(paper, PipelineStage::Indexing, err),
        };

        let metadata = &self.metadata;
        let ctx = self.context("save_metadata").with_paper(&paper.id);
        if let Err(err) = self
            .runner
            .run_with_retry(ErrorCategory::Storage, &ctx, || async move {
                cancel.check()?;
                metadata.save(paper).await.map_err(OperationError::from)
            })
            .await
        {
            return failure(paper, PipelineStage::Metadata, err);
        }

        PaperOutcome::Stored {
            chunks: added.chunks_added,
        }
    }
}
