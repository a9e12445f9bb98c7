//! SQLite vector backend.
//!
//! Collections and records live in two tables. Embeddings are stored as
//! little-endian `f32` BLOBs and metadata as JSON text. Queries load the
//! collection's vectors and rank them by cosine similarity in process.
//!
//! # Schema
//! - `collections`: (name TEXT PRIMARY KEY, metadata TEXT, dimension INTEGER, created_at TEXT)
//! - `records`: (collection TEXT, id TEXT, document TEXT, metadata TEXT, embedding BLOB),
//!   keyed by `(collection, id)`

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{
    batch_dimension, check_dimension, rank_records, Metadata, QueryHit, StorageError, StorageResult,
    VectorBackend, VectorRecord,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    metadata TEXT NOT NULL,
    dimension INTEGER,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    id TEXT NOT NULL,
    document TEXT NOT NULL,
    metadata TEXT NOT NULL,
    embedding BLOB NOT NULL,
    PRIMARY KEY (collection, id)
);
";

/// SQLite-backed [`VectorBackend`].
///
/// The connection sits behind a mutex and every statement runs on the
/// blocking thread pool.
#[derive(Clone)]
pub struct SqliteVectorBackend {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteVectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorBackend").finish_non_exhaustive()
    }
}

impl SqliteVectorBackend {
    /// Open or create the database at `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns `StorageError` if the file cannot be opened or the schema
    /// cannot be created
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        debug!(path = %path.display(), "Opening SQLite vector store");
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Other(format!("SQLite task failed: {}", e)))?
    }
}

/// Serialize an embedding vector to bytes for BLOB storage.
fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Deserialize an embedding vector from BLOB bytes.
fn deserialize_embedding(bytes: &[u8]) -> StorageResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::InvalidData(format!(
            "Embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn parse_metadata(text: &str) -> StorageResult<Metadata> {
    Ok(serde_json::from_str(text)?)
}

/// Stored dimension of a collection; `Err` if the collection does not exist.
fn collection_dimension(conn: &Connection, name: &str) -> StorageResult<Option<usize>> {
    let row: Option<Option<i64>> = conn
        .query_row(
            "SELECT dimension FROM collections WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    match row {
        None => Err(StorageError::CollectionNotFound(name.to_string())),
        Some(dimension) => Ok(dimension.map(|d| d as usize)),
    }
}

fn load_records(conn: &Connection, name: &str) -> StorageResult<Vec<VectorRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, document, metadata, embedding FROM records WHERE collection = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![name], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (id, document, metadata, embedding) = row?;
        records.push(VectorRecord {
            id,
            document,
            metadata: parse_metadata(&metadata)?,
            embedding: deserialize_embedding(&embedding)?,
        });
    }
    Ok(records)
}

#[async_trait]
impl VectorBackend for SqliteVectorBackend {
    async fn create_collection(&self, name: &str, metadata: Metadata) -> StorageResult<bool> {
        let name = name.to_string();
        let metadata = serde_json::to_string(&metadata)?;
        let created_at = chrono::Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO collections (name, metadata, dimension, created_at)
                 VALUES (?1, ?2, NULL, ?3)",
                params![name, metadata, created_at],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn collection_exists(&self, name: &str) -> StorageResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM collections WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn list_collections(&self) -> StorageResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn collection_metadata(&self, name: &str) -> StorageResult<Metadata> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let text: Option<String> = conn
                .query_row(
                    "SELECT metadata FROM collections WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            match text {
                Some(text) => parse_metadata(&text),
                None => Err(StorageError::CollectionNotFound(name)),
            }
        })
        .await
    }

    async fn delete_collection(&self, name: &str) -> StorageResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM records WHERE collection = ?1", params![name])?;
            let removed = tx.execute("DELETE FROM collections WHERE name = ?1", params![name])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn add(&self, collection: &str, records: Vec<VectorRecord>) -> StorageResult<usize> {
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current = collection_dimension(&tx, &collection)?;
            let dimension = batch_dimension(&collection, current, &records)?;
            if dimension != current {
                tx.execute(
                    "UPDATE collections SET dimension = ?2 WHERE name = ?1",
                    params![collection, dimension.map(|d| d as i64)],
                )?;
            }

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO records (collection, id, document, metadata, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(collection, id) DO UPDATE SET
                        document = excluded.document,
                        metadata = excluded.metadata,
                        embedding = excluded.embedding",
                )?;
                for record in &records {
                    stmt.execute(params![
                        collection,
                        record.id,
                        record.document,
                        serde_json::to_string(&record.metadata)?,
                        serialize_embedding(&record.embedding),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        n_results: usize,
    ) -> StorageResult<Vec<QueryHit>> {
        let collection = collection.to_string();
        let embedding = embedding.to_vec();
        self.with_conn(move |conn| {
            let dimension = collection_dimension(conn, &collection)?;
            check_dimension(&collection, dimension, embedding.len())?;
            let records = load_records(conn, &collection)?;
            Ok(rank_records(&records, &embedding, n_results))
        })
        .await
    }

    async fn get_all(&self, collection: &str) -> StorageResult<Vec<VectorRecord>> {
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            collection_dimension(conn, &collection)?;
            load_records(conn, &collection)
        })
        .await
    }

    async fn count(&self, collection: &str) -> StorageResult<usize> {
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            collection_dimension(conn, &collection)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, embedding: Vec<f32>, instance: &str) -> VectorRecord {
        let mut metadata = Metadata::new();
        metadata.insert("instance_name".into(), instance.into());
        VectorRecord {
            id: id.to_string(),
            document: format!("document {}", id),
            metadata,
            embedding,
        }
    }

    #[test]
    fn test_embedding_blob_codec() {
        let embedding = vec![0.25_f32, -1.5, 3.0];
        let bytes = serialize_embedding(&embedding);
        assert_eq!(bytes.len(), 12);
        assert_eq!(deserialize_embedding(&bytes).unwrap(), embedding);
        assert!(deserialize_embedding(&[0, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn test_collection_lifecycle() {
        let backend = SqliteVectorBackend::open_in_memory().unwrap();
        let mut meta = Metadata::new();
        meta.insert("instance_name".into(), "ai_scholar".into());

        assert!(backend.create_collection("c1", meta.clone()).await.unwrap());
        assert!(!backend.create_collection("c1", Metadata::new()).await.unwrap());
        assert!(backend.collection_exists("c1").await.unwrap());
        assert_eq!(backend.collection_metadata("c1").await.unwrap(), meta);

        backend.add("c1", vec![record("a", vec![1.0, 0.0], "ai_scholar")]).await.unwrap();
        assert!(backend.delete_collection("c1").await.unwrap());
        assert!(!backend.collection_exists("c1").await.unwrap());
        assert!(matches!(
            backend.count("c1").await,
            Err(StorageError::CollectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_query_upsert() {
        let backend = SqliteVectorBackend::open_in_memory().unwrap();
        backend.create_collection("c", Metadata::new()).await.unwrap();
        backend
            .add(
                "c",
                vec![
                    record("a", vec![1.0, 0.0], "ai_scholar"),
                    record("b", vec![0.0, 1.0], "ai_scholar"),
                ],
            )
            .await
            .unwrap();
        backend.add("c", vec![record("b", vec![0.6, 0.8], "ai_scholar")]).await.unwrap();
        assert_eq!(backend.count("c").await.unwrap(), 2);

        let hits = backend.query("c", &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].metadata["instance_name"], "ai_scholar");

        let all = backend.get_all("c").await.unwrap();
        assert_eq!(all[1].embedding, vec![0.6, 0.8]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_writes_nothing() {
        let backend = SqliteVectorBackend::open_in_memory().unwrap();
        backend.create_collection("c", Metadata::new()).await.unwrap();
        let err = backend
            .add(
                "c",
                vec![record("a", vec![1.0, 0.0], "x"), record("b", vec![1.0, 0.0, 0.0], "x")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DimensionMismatch { .. }));
        assert_eq!(backend.count("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vectors.db");
        {
            let backend = SqliteVectorBackend::open(&path).unwrap();
            backend.create_collection("c", Metadata::new()).await.unwrap();
            backend.add("c", vec![record("a", vec![1.0, 0.0], "x")]).await.unwrap();
        }
        let reopened = SqliteVectorBackend::open(&path).unwrap();
        assert_eq!(reopened.list_collections().await.unwrap(), vec!["c".to_string()]);
        assert_eq!(reopened.count("c").await.unwrap(), 1);
    }
}
