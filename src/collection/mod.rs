//! Per-instance collection management.
//!
//! Every instance owns exactly one collection in the shared vector backend,
//! named `scholar_instance_<instance>_papers`. Instance names are validated
//! before any storage call, so the naming is injective and no instance can
//! address another instance's collection.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::resilience::{ErrorCategory, OperationError};
use crate::storage::{Metadata, StorageError, VectorBackend};

const COLLECTION_PREFIX: &str = "scholar_instance_";
const COLLECTION_SUFFIX: &str = "_papers";

/// Collection schema tag written into collection metadata.
pub const COLLECTION_SCHEMA: &str = "scholar_instance_v1";

pub const MIN_INSTANCE_NAME_LEN: usize = 2;
pub const MAX_INSTANCE_NAME_LEN: usize = 50;

/// Names that may not be used for instances.
pub const RESERVED_NAMES: [&str; 7] =
    ["admin", "system", "root", "config", "default", "internal", "null"];

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Invalid instance name '{name}': {reason}")]
    InvalidInstanceName { name: String, reason: String },

    #[error("No collection for instance '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type CollectionResult<T> = Result<T, CollectionError>;

impl From<CollectionError> for OperationError {
    fn from(err: CollectionError) -> Self {
        let category = match &err {
            CollectionError::Storage(e) => e.category(),
            _ => ErrorCategory::VectorStore,
        };
        OperationError::categorized(category, err.to_string())
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> CollectionError {
    CollectionError::InvalidInstanceName {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Check an instance name against the naming rules.
///
/// # Errors
/// Returns `CollectionError::InvalidInstanceName` for empty, too short, too
/// long or reserved names and for characters outside `[A-Za-z0-9_-]`
pub fn validate_instance_name(name: &str) -> CollectionResult<()> {
    if name.is_empty() {
        return Err(invalid(name, "name cannot be empty"));
    }
    let len = name.chars().count();
    if len < MIN_INSTANCE_NAME_LEN {
        return Err(invalid(name, format!("must be at least {} characters", MIN_INSTANCE_NAME_LEN)));
    }
    if len > MAX_INSTANCE_NAME_LEN {
        return Err(invalid(name, format!("must be at most {} characters", MAX_INSTANCE_NAME_LEN)));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(invalid(name, format!("character '{}' is not allowed", bad)));
    }
    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(invalid(name, "name is reserved"));
    }
    Ok(())
}

/// Collection name owned by `instance`.
///
/// # Errors
/// Returns `CollectionError::InvalidInstanceName` if the name is invalid
pub fn collection_name(instance: &str) -> CollectionResult<String> {
    validate_instance_name(instance)?;
    Ok(format!("{}{}{}", COLLECTION_PREFIX, instance, COLLECTION_SUFFIX))
}

/// Instance owning `collection`, if it follows the instance naming scheme.
pub fn instance_from_collection_name(collection: &str) -> Option<&str> {
    let instance = collection
        .strip_prefix(COLLECTION_PREFIX)?
        .strip_suffix(COLLECTION_SUFFIX)?;
    validate_instance_name(instance).ok().map(|_| instance)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStatus {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub status: CreateStatus,
    pub collection_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub instance_name: String,
    pub collection_name: String,
}

/// Counts and descriptive metadata of one instance collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub instance_name: String,
    pub collection_name: String,

    /// Number of stored chunks
    pub chunk_count: usize,

    /// Number of distinct papers
    pub paper_count: usize,

    /// Chunk count per hierarchy level
    pub chunks_by_level: BTreeMap<u64, usize>,

    pub embedding_model: Option<String>,
    pub description: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub instance_name: String,
    pub collection_name: String,
    pub valid: bool,
    pub record_count: usize,
    pub issues: Vec<String>,
}

/// Creates, inspects and validates per-instance collections.
#[derive(Clone)]
pub struct CollectionManager {
    backend: Arc<dyn VectorBackend>,
}

impl std::fmt::Debug for CollectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionManager").finish_non_exhaustive()
    }
}

fn meta_str<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

impl CollectionManager {
    pub fn new(backend: Arc<dyn VectorBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn VectorBackend> {
        &self.backend
    }

    /// Create the collection for `instance` if it does not exist yet.
    ///
    /// # Arguments
    /// * `instance` - Instance name
    /// * `embedding_model` - Model whose vectors the collection holds
    /// * `description` - Free-form description stored with the collection
    ///
    /// # Errors
    /// Returns `CollectionError` for an invalid name or a backend failure
    pub async fn create_instance_collection(
        &self,
        instance: &str,
        embedding_model: &str,
        description: Option<&str>,
    ) -> CollectionResult<CreateOutcome> {
        let name = collection_name(instance)?;

        let mut metadata = Metadata::new();
        metadata.insert("instance_name".into(), instance.into());
        metadata.insert("embedding_model".into(), embedding_model.into());
        metadata.insert("schema".into(), COLLECTION_SCHEMA.into());
        metadata.insert("created_at".into(), Utc::now().to_rfc3339().into());
        if let Some(description) = description {
            metadata.insert("description".into(), description.into());
        }

        let status = if self.backend.create_collection(&name, metadata).await? {
            info!(
                instance = %instance,
                collection = %name,
                model = %embedding_model,
                "Created instance collection"
            );
            CreateStatus::Created
        } else {
            CreateStatus::AlreadyExists
        };
        Ok(CreateOutcome {
            status,
            collection_name: name,
        })
    }

    /// Instance collections present in the backend; other collections are ignored.
    pub async fn list_instance_collections(&self) -> CollectionResult<Vec<CollectionSummary>> {
        let names = self.backend.list_collections().await?;
        Ok(names
            .into_iter()
            .filter_map(|name| {
                instance_from_collection_name(&name).map(|instance| CollectionSummary {
                    instance_name: instance.to_string(),
                    collection_name: name.clone(),
                })
            })
            .collect())
    }

    /// # Errors
    /// Returns `CollectionError::NotFound` if the instance has no collection
    pub async fn get_collection_stats(&self, instance: &str) -> CollectionResult<CollectionStats> {
        let name = collection_name(instance)?;
        if !self.backend.collection_exists(&name).await? {
            return Err(CollectionError::NotFound(instance.to_string()));
        }
        let metadata = self.backend.collection_metadata(&name).await?;
        let records = self.backend.get_all(&name).await?;

        let mut papers = BTreeSet::new();
        let mut chunks_by_level = BTreeMap::new();
        for record in &records {
            if let Some(document_id) = meta_str(&record.metadata, "document_id") {
                papers.insert(document_id.to_string());
            }
            if let Some(level) = record.metadata.get("chunk_level").and_then(Value::as_u64) {
                *chunks_by_level.entry(level).or_insert(0) += 1;
            }
        }

        Ok(CollectionStats {
            instance_name: instance.to_string(),
            collection_name: name,
            chunk_count: records.len(),
            paper_count: papers.len(),
            chunks_by_level,
            embedding_model: meta_str(&metadata, "embedding_model").map(str::to_string),
            description: meta_str(&metadata, "description").map(str::to_string),
            created_at: meta_str(&metadata, "created_at").map(str::to_string),
        })
    }

    /// Check that the instance's collection holds only well-formed records of its own.
    ///
    /// Problems are reported in the returned `issues`, not as errors.
    ///
    /// # Errors
    /// Returns `CollectionError` for an invalid name or a backend failure
    pub async fn validate_collection_integrity(
        &self,
        instance: &str,
    ) -> CollectionResult<IntegrityReport> {
        let name = collection_name(instance)?;
        let mut report = IntegrityReport {
            instance_name: instance.to_string(),
            collection_name: name.clone(),
            valid: true,
            record_count: 0,
            issues: Vec::new(),
        };

        if !self.backend.collection_exists(&name).await? {
            report.valid = false;
            report.issues.push(format!("collection {} does not exist", name));
            return Ok(report);
        }

        let metadata = self.backend.collection_metadata(&name).await?;
        match meta_str(&metadata, "instance_name") {
            Some(owner) if owner == instance => {}
            Some(owner) => report
                .issues
                .push(format!("collection metadata names instance '{}'", owner)),
            None => report.issues.push("collection metadata has no instance_name".to_string()),
        }

        let records = self.backend.get_all(&name).await?;
        report.record_count = records.len();
        let ids: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let mut dimension: Option<usize> = None;

        for record in &records {
            match meta_str(&record.metadata, "instance_name") {
                Some(owner) if owner == instance => {}
                Some(owner) => report
                    .issues
                    .push(format!("record {} belongs to instance '{}'", record.id, owner)),
                None => report.issues.push(format!("record {} has no instance_name", record.id)),
            }
            if meta_str(&record.metadata, "document_id").is_none() {
                report.issues.push(format!("record {} has no document_id", record.id));
            }
            if record.metadata.get("chunk_level").and_then(Value::as_u64).is_none() {
                report.issues.push(format!("record {} has no chunk_level", record.id));
            }
            match dimension {
                None => dimension = Some(record.embedding.len()),
                Some(d) if d != record.embedding.len() => report.issues.push(format!(
                    "record {} has dimension {}, expected {}",
                    record.id,
                    record.embedding.len(),
                    d
                )),
                Some(_) => {}
            }
            if let Some(parent) = meta_str(&record.metadata, "parent_chunk_id") {
                if !ids.contains(parent) {
                    report
                        .issues
                        .push(format!("record {} references missing parent {}", record.id, parent));
                }
            }
        }

        report.valid = report.issues.is_empty();
        if !report.valid {
            warn!(
                instance = %instance,
                issues = report.issues.len(),
                "Collection integrity check failed"
            );
        }
        Ok(report)
    }

    /// Drop the instance's collection and all its records.
    ///
    /// # Returns
    /// `true` if a collection was removed
    pub async fn delete_instance_collection(&self, instance: &str) -> CollectionResult<bool> {
        let name = collection_name(instance)?;
        let removed = self.backend.delete_collection(&name).await?;
        if removed {
            info!(instance = %instance, collection = %name, "Deleted instance collection");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryVectorBackend, VectorRecord};
    use serde_json::json;

    fn manager() -> CollectionManager {
        CollectionManager::new(Arc::new(InMemoryVectorBackend::new()))
    }

    fn chunk_record(id: &str, instance: &str, level: u64, parent: Option<&str>) -> VectorRecord {
        let mut metadata = Metadata::new();
        metadata.insert("instance_name".into(), instance.into());
        metadata.insert("document_id".into(), "p1".into());
        metadata.insert("chunk_level".into(), json!(level));
        metadata.insert("parent_chunk_id".into(), parent.map_or(Value::Null, |p| p.into()));
        VectorRecord {
            id: id.to_string(),
            document: "text".to_string(),
            metadata,
            embedding: vec![1.0, 0.0],
        }
    }

    #[test]
    fn test_collection_naming() {
        assert_eq!(collection_name("ai_scholar").unwrap(), "scholar_instance_ai_scholar_papers");
        assert_eq!(
            instance_from_collection_name("scholar_instance_ai_scholar_papers"),
            Some("ai_scholar")
        );
        assert_eq!(instance_from_collection_name("other_collection"), None);
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let too_long = "x".repeat(60);
        for name in ["", "a", "admin", "System", "test@scholar", "has space", too_long.as_str()] {
            assert!(
                matches!(collection_name(name), Err(CollectionError::InvalidInstanceName { .. })),
                "{name:?} should be rejected"
            );
        }
        assert!(collection_name("quant-scholar_2").is_ok());
        assert!(collection_name(&"x".repeat(50)).is_ok());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let manager = manager();
        let first = manager
            .create_instance_collection("ai_scholar", "hash-64", Some("AI papers"))
            .await
            .unwrap();
        assert_eq!(first.status, CreateStatus::Created);
        let second = manager
            .create_instance_collection("ai_scholar", "hash-64", None)
            .await
            .unwrap();
        assert_eq!(second.status, CreateStatus::AlreadyExists);
        assert_eq!(second.collection_name, first.collection_name);

        let listed = manager.list_instance_collections().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].instance_name, "ai_scholar");
    }

    #[tokio::test]
    async fn test_stats_and_integrity() {
        let manager = manager();
        manager
            .create_instance_collection("ai_scholar", "hash-64", Some("AI papers"))
            .await
            .unwrap();
        let name = collection_name("ai_scholar").unwrap();
        manager
            .backend()
            .add(
                &name,
                vec![
                    chunk_record("p1_L0_C0", "ai_scholar", 0, Some("p1_L1_C0")),
                    chunk_record("p1_L0_C1", "ai_scholar", 0, Some("p1_L1_C0")),
                    chunk_record("p1_L1_C0", "ai_scholar", 1, None),
                ],
            )
            .await
            .unwrap();

        let stats = manager.get_collection_stats("ai_scholar").await.unwrap();
        assert_eq!(stats.chunk_count, 3);
        assert_eq!(stats.paper_count, 1);
        assert_eq!(stats.chunks_by_level.get(&0), Some(&2));
        assert_eq!(stats.embedding_model.as_deref(), Some("hash-64"));
        assert_eq!(stats.description.as_deref(), Some("AI papers"));

        let report = manager.validate_collection_integrity("ai_scholar").await.unwrap();
        assert!(report.valid, "{:?}", report.issues);
        assert_eq!(report.record_count, 3);
    }

    #[tokio::test]
    async fn test_integrity_detects_foreign_and_orphan_records() {
        let manager = manager();
        manager.create_instance_collection("ai_scholar", "hash-64", None).await.unwrap();
        let name = collection_name("ai_scholar").unwrap();
        manager
            .backend()
            .add(
                &name,
                vec![
                    chunk_record("p1_L0_C0", "quant_scholar", 0, None),
                    chunk_record("p1_L0_C1", "ai_scholar", 0, Some("p1_L1_C9")),
                ],
            )
            .await
            .unwrap();

        let report = manager.validate_collection_integrity("ai_scholar").await.unwrap();
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.contains("quant_scholar")));
        assert!(report.issues.iter().any(|i| i.contains("missing parent")));
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let manager = manager();
        assert!(matches!(
            manager.get_collection_stats("ai_scholar").await,
            Err(CollectionError::NotFound(_))
        ));
        let report = manager.validate_collection_integrity("ai_scholar").await.unwrap();
        assert!(!report.valid);
        assert!(!manager.delete_instance_collection("ai_scholar").await.unwrap());
    }
}
