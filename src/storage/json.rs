//! JSON-directory metadata store.
//!
//! Papers are written one file per paper under `<root>/<instance>/`. File
//! names are derived from the paper id; ids containing characters outside
//! `[A-Za-z0-9._-]` get a short hash suffix so distinct ids never collide.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use super::{MetadataStore, StorageError, StorageResult};
use crate::models::Paper;

#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    root: PathBuf,
}

impl JsonMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join(file_stem(instance))
    }

    fn paper_path(&self, instance: &str, paper_id: &str) -> PathBuf {
        self.instance_dir(instance).join(format!("{}.json", file_stem(paper_id)))
    }
}

/// Filesystem-safe, injective name for an id.
fn file_stem(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    if safe == id && !id.starts_with('.') {
        return safe;
    }
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{}-{}", safe.trim_start_matches('.'), &digest[..12])
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn exists(&self, instance: &str, paper_id: &str) -> StorageResult<bool> {
        Ok(fs::try_exists(self.paper_path(instance, paper_id)).await?)
    }

    async fn save(&self, paper: &Paper) -> StorageResult<()> {
        if paper.instance_name.is_empty() {
            return Err(StorageError::InvalidData(format!("Paper {} has no instance", paper.id)));
        }
        let dir = self.instance_dir(&paper.instance_name);
        fs::create_dir_all(&dir).await?;

        let path = self.paper_path(&paper.instance_name, &paper.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(paper)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        debug!(
            paper_id = %paper.id,
            instance = %paper.instance_name,
            path = %path.display(),
            "Saved paper metadata"
        );
        Ok(())
    }

    async fn load(&self, instance: &str, paper_id: &str) -> StorageResult<Option<Paper>> {
        let path = self.paper_path(instance, paper_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn count(&self, instance: &str) -> StorageResult<usize> {
        let mut entries = match fs::read_dir(self.instance_dir(instance)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                count += 1;
            }
        }
        Ok(count)
    }
}
