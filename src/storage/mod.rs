//! Storage layer abstraction and implementations.
//!
//! Two interfaces live here:
//!
//! - [`VectorBackend`]: named collections of `{id, document, metadata,
//!   embedding}` records with brute-force nearest-neighbour queries. Backed
//!   by memory ([`memory::InMemoryVectorBackend`]) or SQLite
//!   ([`sqlite::SqliteVectorBackend`]).
//! - [`MetadataStore`]: persisted paper metadata used for duplicate checks
//!   during ingestion. Backed by memory ([`memory::InMemoryMetadataStore`]) or
//!   a JSON directory ([`json::JsonMetadataStore`]).

pub mod json;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::Paper;
use crate::query::cosine_similarity;
use crate::resilience::{ErrorCategory, OperationError};

pub use json::JsonMetadataStore;
pub use memory::{InMemoryMetadataStore, InMemoryVectorBackend};
pub use sqlite::SqliteVectorBackend;

/// Free-form JSON metadata attached to collections and records.
pub type Metadata = serde_json::Map<String, Value>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Collection does not exist
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// Vector size differs from the collection's
    #[error("Dimension mismatch in collection {collection}: expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    /// Stored or supplied data is malformed
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other unexpected errors
    #[error("Unexpected storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Taxonomy category of this failure.
    pub fn category(&self) -> ErrorCategory {
        match self {
            StorageError::CollectionNotFound(_) | StorageError::DimensionMismatch { .. } => {
                ErrorCategory::VectorStore
            }
            _ => ErrorCategory::Storage,
        }
    }
}

impl From<StorageError> for OperationError {
    fn from(err: StorageError) -> Self {
        OperationError::categorized(err.category(), err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A stored vector with its source text and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// A query match, scored by cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    pub similarity: f32,
}

/// Trait for vector storage backends.
///
/// Records are upserted by id within a collection. Every record in a
/// collection has the same dimension, fixed by the first record added.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Create a collection if it does not exist.
    ///
    /// # Returns
    /// `true` if the collection was created, `false` if it already existed
    /// (its metadata is left untouched)
    ///
    /// # Errors
    /// Returns `StorageError` if the backend fails
    async fn create_collection(&self, name: &str, metadata: Metadata) -> StorageResult<bool>;

    async fn collection_exists(&self, name: &str) -> StorageResult<bool>;

    /// Names of all collections, sorted.
    async fn list_collections(&self) -> StorageResult<Vec<String>>;

    /// # Errors
    /// Returns `StorageError::CollectionNotFound` for unknown collections
    async fn collection_metadata(&self, name: &str) -> StorageResult<Metadata>;

    /// Delete a collection and its records.
    ///
    /// # Returns
    /// `true` if a collection was removed
    async fn delete_collection(&self, name: &str) -> StorageResult<bool>;

    /// Upsert records into a collection.
    ///
    /// # Returns
    /// The number of records written
    ///
    /// # Errors
    /// Returns `StorageError::CollectionNotFound` for unknown collections and
    /// `StorageError::DimensionMismatch` if a vector has the wrong size; no
    /// record of a failed call is written
    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> StorageResult<usize>;

    /// Nearest records to `embedding`, best first, at most `n_results`.
    ///
    /// # Errors
    /// Returns `StorageError::CollectionNotFound` for unknown collections and
    /// `StorageError::DimensionMismatch` for a query of the wrong size
    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        n_results: usize,
    ) -> StorageResult<Vec<QueryHit>>;

    /// All records of a collection, ordered by id.
    async fn get_all(&self, collection: &str) -> StorageResult<Vec<VectorRecord>>;

    async fn count(&self, collection: &str) -> StorageResult<usize>;
}

/// Trait for persisted paper metadata, keyed by `(instance, paper id)`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn exists(&self, instance: &str, paper_id: &str) -> StorageResult<bool>;

    /// Save (or overwrite) a paper under its `instance_name`.
    ///
    /// # Errors
    /// Returns `StorageError::InvalidData` if the paper has no instance
    async fn save(&self, paper: &Paper) -> StorageResult<()>;

    async fn load(&self, instance: &str, paper_id: &str) -> StorageResult<Option<Paper>>;

    /// Number of papers saved for `instance`.
    async fn count(&self, instance: &str) -> StorageResult<usize>;
}

/// Check a vector against the collection's dimension, if one is fixed.
pub(crate) fn check_dimension(
    collection: &str,
    expected: Option<usize>,
    actual: usize,
) -> StorageResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(StorageError::DimensionMismatch {
            collection: collection.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Dimension shared by `records`, checked against `expected`.
pub(crate) fn batch_dimension(
    collection: &str,
    expected: Option<usize>,
    records: &[VectorRecord],
) -> StorageResult<Option<usize>> {
    let mut dimension = expected;
    for record in records {
        if record.embedding.is_empty() {
            return Err(StorageError::InvalidData(format!(
                "Record {} has an empty embedding",
                record.id
            )));
        }
        check_dimension(collection, dimension, record.embedding.len())?;
        dimension = Some(record.embedding.len());
    }
    Ok(dimension)
}

/// Score records against `embedding` and keep the best `n_results`.
///
/// Ties are broken by id so results are deterministic.
pub(crate) fn rank_records<'a, I>(records: I, embedding: &[f32], n_results: usize) -> Vec<QueryHit>
where
    I: IntoIterator<Item = &'a VectorRecord>,
{
    let mut scored: Vec<(f32, &VectorRecord)> = records
        .into_iter()
        .map(|record| (cosine_similarity(embedding, &record.embedding), record))
        .collect();
    scored.sort_by(|(sa, ra), (sb, rb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ra.id.cmp(&rb.id))
    });
    scored
        .into_iter()
        .take(n_results)
        .map(|(similarity, record)| QueryHit {
            id: record.id.clone(),
            document: record.document.clone(),
            metadata: record.metadata.clone(),
            similarity,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            document: format!("document {}", id),
            metadata: Metadata::new(),
            embedding,
        }
    }

    #[test]
    fn test_rank_records_orders_and_truncates() {
        let records = vec![
            record("a", vec![0.0, 1.0]),
            record("b", vec![1.0, 0.0]),
            record("c", vec![0.7, 0.7]),
        ];
        let hits = rank_records(&records, &[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "b");
        assert_eq!(hits[1].id, "c");
        assert!(hits[0].similarity >= hits[1].similarity);
    }

    #[test]
    fn test_rank_records_ties_by_id() {
        let records = vec![record("z", vec![1.0, 0.0]), record("m", vec![1.0, 0.0])];
        let hits = rank_records(&records, &[1.0, 0.0], 10);
        assert_eq!(hits[0].id, "m");
        assert_eq!(hits[1].id, "z");
    }

    #[test]
    fn test_batch_dimension() {
        let records = vec![record("a", vec![1.0, 0.0]), record("b", vec![0.0, 1.0])];
        assert_eq!(batch_dimension("c", None, &records).unwrap(), Some(2));
        assert!(matches!(
            batch_dimension("c", Some(3), &records),
            Err(StorageError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));
        assert!(matches!(
            batch_dimension("c", None, &[record("e", vec![])]),
            Err(StorageError::InvalidData(_))
        ));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            StorageError::CollectionNotFound("x".into()).category(),
            ErrorCategory::VectorStore
        );
        assert_eq!(
            StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).category(),
            ErrorCategory::Storage
        );
        let op: OperationError = StorageError::InvalidData("bad".into()).into();
        assert!(matches!(
            op,
            OperationError::Failed { category_hint: Some(ErrorCategory::Storage), .. }
        ));
    }
}
