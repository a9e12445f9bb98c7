//! Scholar Index - multi-instance ingestion and semantic search for scholarly papers.
//!
//! Each *instance* (for example `ai_scholar` or `quant_scholar`) owns its own
//! vector collection, chunking parameters and embedding model. Papers are
//! discovered from a source, downloaded, converted to text, split into
//! hierarchical chunks and indexed into their instance's collection. Search
//! runs against one instance or fans out across all of them with a merged
//! global ranking.
//!
//! # Architecture
//!
//! - **resilience**: Retry policies, circuit breakers, error classification
//!   and the runner that combines them
//! - **chunking**: Hierarchical sentence-aware text chunking
//! - **embedding**: Embedding providers and the caching embedding service
//! - **collection** / **storage**: Per-instance collections over a vector
//!   backend (in-memory or SQLite) plus paper metadata stores
//! - **vector_store**: The multi-instance store with search, health checks
//!   and separation validation
//! - **provider** / **extraction** / **ingestion**: Paper sources, text
//!   extraction and the download pipeline
//! - **config** / **context** / **server**: Configuration, process wiring and
//!   the JSON-lines API
//!
//! # Example
//!
//! ```ignore
//! use scholar_index::{config::AppConfig, context::ScholarContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = ScholarContext::init(AppConfig::resolve(None)?).await?;
//!
//!     let hits = context.store().search_all_instances("attention transformer", 10).await?;
//!     for hit in hits {
//!         println!("[{}] {} ({:.3})", hit.instance_name, hit.title, hit.relevance_score);
//!     }
//!
//!     context.close().await?;
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod collection;
pub mod config;
pub mod context;
pub mod embedding;
pub mod extraction;
pub mod ingestion;
pub mod models;
pub mod provider;
pub mod query;
pub mod resilience;
pub mod server;
pub mod storage;
pub mod vector_store;

// Re-export commonly used types at the crate root
pub use config::AppConfig;
pub use context::ScholarContext;
pub use embedding::{EmbeddingProvider, EmbeddingService};
pub use ingestion::{DownloadStats, ScholarDownloader};
pub use models::{Author, Paper, RelevanceLevel, SearchHit};
pub use query::SearchQuery;
pub use resilience::{ErrorClassifier, ResilientRunner};
pub use vector_store::{InstanceConfig, MultiInstanceVectorStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model for new instances
pub const DEFAULT_EMBEDDING_MODEL: &str = "hash-384";

/// Model used by the OpenAI provider when none is configured
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
