//! In-memory storage backends.
//!
//! Used for tests and for runs that do not need persistence. Locks are
//! `parking_lot` and are never held across an `.await`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    batch_dimension, check_dimension, rank_records, Metadata, MetadataStore, QueryHit, StorageError,
    StorageResult, VectorBackend, VectorRecord,
};
use crate::models::Paper;

#[derive(Debug, Default)]
struct MemoryCollection {
    metadata: Metadata,
    dimension: Option<usize>,
    records: BTreeMap<String, VectorRecord>,
}

/// Vector backend holding every collection in process memory.
#[derive(Debug, Default)]
pub struct InMemoryVectorBackend {
    collections: RwLock<BTreeMap<String, MemoryCollection>>,
}

impl InMemoryVectorBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(name: &str) -> StorageError {
    StorageError::CollectionNotFound(name.to_string())
}

#[async_trait]
impl VectorBackend for InMemoryVectorBackend {
    async fn create_collection(&self, name: &str, metadata: Metadata) -> StorageResult<bool> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Ok(false);
        }
        collections.insert(
            name.to_string(),
            MemoryCollection {
                metadata,
                ..MemoryCollection::default()
            },
        );
        Ok(true)
    }

    async fn collection_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.collections.read().contains_key(name))
    }

    async fn list_collections(&self) -> StorageResult<Vec<String>> {
        Ok(self.collections.read().keys().cloned().collect())
    }

    async fn collection_metadata(&self, name: &str) -> StorageResult<Metadata> {
        self.collections
            .read()
            .get(name)
            .map(|c| c.metadata.clone())
            .ok_or_else(|| not_found(name))
    }

    async fn delete_collection(&self, name: &str) -> StorageResult<bool> {
        Ok(self.collections.write().remove(name).is_some())
    }

    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> StorageResult<usize> {
        let mut collections = self.collections.write();
        let target = collections.get_mut(collection).ok_or_else(|| not_found(collection))?;
        target.dimension = batch_dimension(collection, target.dimension, &records)?;
        let written = records.len();
        for record in records {
            target.records.insert(record.id.clone(), record);
        }
        Ok(written)
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        n_results: usize,
    ) -> StorageResult<Vec<QueryHit>> {
        let collections = self.collections.read();
        let target = collections.get(collection).ok_or_else(|| not_found(collection))?;
        check_dimension(collection, target.dimension, embedding.len())?;
        Ok(rank_records(target.records.values(), embedding, n_results))
    }

    async fn get_all(&self, collection: &str) -> StorageResult<Vec<VectorRecord>> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.records.values().cloned().collect())
            .ok_or_else(|| not_found(collection))
    }

    async fn count(&self, collection: &str) -> StorageResult<usize> {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.records.len())
            .ok_or_else(|| not_found(collection))
    }
}

/// Metadata store keeping papers in a map.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    papers: RwLock<HashMap<(String, String), Paper>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn exists(&self, instance: &str, paper_id: &str) -> StorageResult<bool> {
        Ok(self
            .papers
            .read()
            .contains_key(&(instance.to_string(), paper_id.to_string())))
    }

    async fn save(&self, paper: &Paper) -> StorageResult<()> {
        if paper.instance_name.is_empty() {
            return Err(StorageError::InvalidData(format!("Paper {} has no instance", paper.id)));
        }
        self.papers
            .write()
            .insert((paper.instance_name.clone(), paper.id.clone()), paper.clone());
        Ok(())
    }

    async fn load(&self, instance: &str, paper_id: &str) -> StorageResult<Option<Paper>> {
        Ok(self
            .papers
            .read()
            .get(&(instance.to_string(), paper_id.to_string()))
            .cloned())
    }

    async fn count(&self, instance: &str) -> StorageResult<usize> {
        Ok(self.papers.read().keys().filter(|(i, _)| i == instance).count())
    }
}
