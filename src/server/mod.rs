//! Request API over the multi-instance store.
//!
//! The server speaks JSON lines: one request object per input line, one
//! response object per output line. Requests are tagged by `op`:
//!
//! ```json
//! {"id": 1, "op": "search_all_instances", "query": "attention transformer", "n_results": 5}
//! {"id": 1, "ok": true, "result": [{"chunk_id": "...", "global_rank": 1, "...": "..."}]}
//! ```
//!
//! A failed request yields `ok: false` and an `error` of the form
//! `{"kind": "unknown_instance", "message": "..."}`; the loop keeps serving.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::context::ScholarContext;
use crate::models::Paper;
use crate::query::DEFAULT_N_RESULTS;
use crate::resilience::classifier::ReportError;
use crate::resilience::ErrorClassifier;
use crate::storage::{MetadataStore, StorageError};
use crate::vector_store::{MultiInstanceVectorStore, VectorStoreError};

/// Errors that can occur while handling a request.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed or unsupported request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport failure of the serve loop
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    /// Stable machine-readable kind for error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::VectorStore(e) => match e {
                VectorStoreError::UnknownInstance(_) => "unknown_instance",
                VectorStoreError::InstanceMismatch { .. }
                | VectorStoreError::DocumentMismatch { .. } => "instance_mismatch",
                VectorStoreError::Query(_)
                | VectorStoreError::EmptyDocument(_)
                | VectorStoreError::InvalidConfig(_) => "invalid_request",
                other => other.category().as_str(),
            },
            ServerError::Storage(e) => e.category().as_str(),
            ServerError::Report(_) | ServerError::Io(_) => "storage",
            ServerError::Serialization(_) => "internal",
        }
    }
}

fn default_n_results() -> usize {
    DEFAULT_N_RESULTS
}

/// Supported operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Chunk, embed and store a paper's text; records the paper's metadata
    AddInstanceDocument { instance: String, paper: Paper, text: String },

    SearchInstancePapers {
        instance: String,
        query: String,
        #[serde(default = "default_n_results")]
        n_results: usize,
    },

    SearchAllInstances {
        query: String,
        #[serde(default = "default_n_results")]
        n_results: usize,
    },

    FindSimilarPapers {
        paper: Paper,
        #[serde(default = "default_n_results")]
        n_results: usize,
        #[serde(default)]
        exclude_same_instance: bool,
    },

    GetInstanceStats { instance: String },

    ListInstances,

    HealthCheck,

    ValidateInstanceSeparation,

    /// Write the error classifier's report to `path`
    ExportReport { path: PathBuf },
}

/// A request with an optional client-chosen correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(flatten)]
    pub request: ApiRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, err: &ServerError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ApiError {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Serves [`ApiRequest`]s against a store.
pub struct ScholarServer {
    store: Arc<MultiInstanceVectorStore>,
    metadata: Arc<dyn MetadataStore>,
    classifier: Arc<ErrorClassifier>,
}

impl ScholarServer {
    pub fn new(
        store: Arc<MultiInstanceVectorStore>,
        metadata: Arc<dyn MetadataStore>,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            store,
            metadata,
            classifier,
        }
    }

    pub fn from_context(context: &ScholarContext) -> Self {
        Self::new(
            Arc::clone(context.store()),
            Arc::clone(context.metadata()),
            Arc::clone(context.classifier()),
        )
    }

    /// Execute one request.
    ///
    /// # Returns
    /// The operation's result as JSON
    ///
    /// # Errors
    /// Returns `ServerError` if the operation fails
    pub async fn handle(&self, request: ApiRequest) -> ServerResult<Value> {
        match request {
            ApiRequest::AddInstanceDocument { instance, paper, text } => {
                let paper = if paper.instance_name.is_empty() {
                    paper.with_instance(instance.as_str())
                } else {
                    paper
                };
                let outcome = self.store.add_paper_text(&instance, &paper, &text).await?;
                self.metadata.save(&paper).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            ApiRequest::SearchInstancePapers {
                instance,
                query,
                n_results,
            } => {
                let hits = self.store.search_instance_papers(&instance, &query, n_results).await?;
                Ok(serde_json::to_value(hits)?)
            }
            ApiRequest::SearchAllInstances { query, n_results } => {
                let hits = self.store.search_all_instances(&query, n_results).await?;
                Ok(serde_json::to_value(hits)?)
            }
            ApiRequest::FindSimilarPapers {
                paper,
                n_results,
                exclude_same_instance,
            } => {
                let hits = self
                    .store
                    .find_similar_papers_across_instances(&paper, n_results, exclude_same_instance)
                    .await?;
                Ok(serde_json::to_value(hits)?)
            }
            ApiRequest::GetInstanceStats { instance } => {
                let stats = self.store.get_instance_stats(&instance).await?;
                let papers = self.metadata.count(&instance).await?;
                let mut value = serde_json::to_value(stats)?;
                if let Value::Object(map) = &mut value {
                    map.insert("stored_papers".to_string(), json!(papers));
                }
                Ok(value)
            }
            ApiRequest::ListInstances => Ok(json!(self.store.list_instances())),
            ApiRequest::HealthCheck => {
                let mut value = serde_json::to_value(self.store.health_check().await)?;
                if let Value::Object(map) = &mut value {
                    map.insert(
                        "processing_health".to_string(),
                        json!(self.classifier.health_status()),
                    );
                }
                Ok(value)
            }
            ApiRequest::ValidateInstanceSeparation => {
                Ok(serde_json::to_value(self.store.validate_instance_separation().await?)?)
            }
            ApiRequest::ExportReport { path } => {
                let report = self.classifier.export_report(&path).await?;
                Ok(json!({
                    "path": path.display().to_string(),
                    "health_status": report.summary.health_status,
                    "total_errors": report.summary.stats.total_errors,
                }))
            }
        }
    }

    /// Execute a request and wrap the outcome in a response.
    pub async fn respond(&self, envelope: ApiEnvelope) -> ApiResponse {
        let ApiEnvelope { id, request } = envelope;
        match self.handle(request).await {
            Ok(result) => ApiResponse::success(id, result),
            Err(err) => {
                warn!(kind = err.kind(), "Request failed: {}", err);
                ApiResponse::failure(id, &err)
            }
        }
    }

    /// Parse one JSON line and respond to it.
    pub async fn handle_line(&self, line: &str) -> ApiResponse {
        match serde_json::from_str::<ApiEnvelope>(line) {
            Ok(envelope) => self.respond(envelope).await,
            Err(e) => {
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").cloned());
                ApiResponse::failure(id, &ServerError::InvalidRequest(e.to_string()))
            }
        }
    }

    /// Serve JSON lines from `reader` to `writer` until end of input.
    ///
    /// # Errors
    /// Returns `ServerError::Io` if reading or writing fails
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> ServerResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut served: u64 = 0;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = self.handle_line(line).await;
            let mut out = serde_json::to_vec(&response)?;
            out.push(b'\n');
            writer.write_all(&out).await?;
            writer.flush().await?;
            served += 1;
            debug!(served, ok = response.ok, "Served request");
        }
        info!(served, "Input closed, stopping server");
        Ok(())
    }

    /// Serve on stdin/stdout.
    ///
    /// # Errors
    /// Returns `ServerError::Io` on a transport failure
    pub async fn serve_stdio(&self) -> ServerResult<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }
}
