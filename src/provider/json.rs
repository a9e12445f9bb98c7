//! JSON file paper provider.
//!
//! Reads papers from a local JSON array. Each entry carries the paper's
//! metadata plus either inline `content` or a `content_path` (relative to the
//! JSON file) pointing at a text or PDF file.
//!
//! ```json
//! [
//!   {"id": "p1", "title": "A Paper", "categories": ["cs.AI"], "content": "Full text..."},
//!   {"id": "p2", "title": "Another", "content_path": "pdfs/p2.pdf"}
//! ]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    ContentType, DiscoveryQuery, DownloadedContent, PaperSource, ProviderError, ProviderResult,
};
use crate::models::Paper;
use crate::resilience::ErrorCategory;

pub const SOURCE_NAME: &str = "json_file";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct JsonPaperEntry {
    #[serde(flatten)]
    paper: Paper,

    #[serde(default)]
    content: Option<String>,

    #[serde(default)]
    content_path: Option<PathBuf>,
}

/// Provider reading papers from a JSON file.
#[derive(Debug)]
pub struct JsonFilePaperProvider {
    path: PathBuf,

    /// Entries from the last discovery, by paper id
    entries: RwLock<HashMap<String, JsonPaperEntry>>,
}

fn parse_entries(raw: &str) -> ProviderResult<Vec<JsonPaperEntry>> {
    serde_json::from_str(raw)
        .map_err(|e| ProviderError::ParseError(format!("Invalid paper JSON: {}", e)))
}

impl JsonFilePaperProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resolve(&self, content_path: &Path) -> PathBuf {
        if content_path.is_absolute() {
            return content_path.to_path_buf();
        }
        self.path
            .parent()
            .map_or_else(|| content_path.to_path_buf(), |dir| dir.join(content_path))
    }

    async fn load(&self) -> ProviderResult<Vec<JsonPaperEntry>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let entries = parse_entries(&raw)?;
        let mut cache = self.entries.write();
        cache.clear();
        for entry in &entries {
            cache.insert(entry.paper.id.clone(), entry.clone());
        }
        Ok(entries)
    }
}

#[async_trait]
impl PaperSource for JsonFilePaperProvider {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Storage
    }

    async fn discover(&self, query: &DiscoveryQuery) -> ProviderResult<Vec<Paper>> {
        let entries = self.load().await?;
        let total = entries.len();
        let papers: Vec<Paper> = entries
            .into_iter()
            .map(|mut entry| {
                if entry.paper.source.is_empty() {
                    entry.paper.source = SOURCE_NAME.to_string();
                }
                entry.paper
            })
            .filter(|p| query.matches_categories(p) && query.matches_dates(p))
            .take(query.max_results)
            .collect();
        info!(
            path = %self.path.display(),
            total,
            selected = papers.len(),
            "Loaded papers from JSON"
        );
        Ok(papers)
    }

    fn extract_metadata(&self, raw: &str) -> ProviderResult<Vec<Paper>> {
        Ok(parse_entries(raw)?.into_iter().map(|e| e.paper).collect())
    }

    async fn download(&self, paper: &Paper) -> ProviderResult<DownloadedContent> {
        let entry = self.entries.read().get(&paper.id).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => self
                .load()
                .await?
                .into_iter()
                .find(|e| e.paper.id == paper.id)
                .ok_or_else(|| {
                    ProviderError::NotFound(format!(
                        "Paper {} not in {}",
                        paper.id,
                        self.path.display()
                    ))
                })?,
        };

        if let Some(content) = entry.content {
            return Ok(DownloadedContent {
                paper_id: paper.id.clone(),
                bytes: content.into_bytes(),
                content_type: ContentType::PlainText,
                source_url: None,
            });
        }

        let content_path = entry
            .content_path
            .ok_or_else(|| ProviderError::NotFound(format!("Paper {} has no content", paper.id)))?;
        let resolved = self.resolve(&content_path);
        let bytes = tokio::fs::read(&resolved).await?;
        let content_type = match resolved.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("pdf") => ContentType::Pdf,
            _ => ContentType::PlainText,
        };
        Ok(DownloadedContent {
            paper_id: paper.id.clone(),
            bytes,
            content_type,
            source_url: Some(resolved.display().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path) -> PathBuf {
        std::fs::write(dir.join("p2.txt"), "Text stored next to the index.").unwrap();
        let json = r#"[
            {"id": "p1", "title": "Inline", "categories": ["cs.AI"], "publish_year": 2023,
             "content": "Inline text."},
            {"id": "p2", "title": "From file", "categories": ["q-fin.ST"],
             "content_path": "p2.txt"},
            {"id": "p3", "title": "No content", "categories": ["cs.AI"]}
        ]"#;
        let path = dir.join("papers.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[tokio::test]
    async fn test_discover_filters_and_stamps_source() {
        let dir = tempfile::tempdir().unwrap();
        let provider = JsonFilePaperProvider::new(write_fixture(dir.path()));

        let all = provider.discover(&DiscoveryQuery::new(&[], 10)).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|p| p.source == SOURCE_NAME));

        let ai = provider.discover(&DiscoveryQuery::new(&["cs.AI"], 10)).await.unwrap();
        assert_eq!(ai.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["p1", "p3"]);

        let limited = provider.discover(&DiscoveryQuery::new(&[], 1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_download_inline_and_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let provider = JsonFilePaperProvider::new(write_fixture(dir.path()));
        let papers = provider.discover(&DiscoveryQuery::new(&[], 10)).await.unwrap();

        let inline = provider.download(&papers[0]).await.unwrap();
        assert_eq!(inline.bytes, b"Inline text.".to_vec());
        assert_eq!(inline.content_type, ContentType::PlainText);

        let from_file = provider.download(&papers[1]).await.unwrap();
        assert_eq!(String::from_utf8(from_file.bytes).unwrap(), "Text stored next to the index.");

        assert!(matches!(
            provider.download(&papers[2]).await,
            Err(ProviderError::NotFound(_))
        ));
        assert!(matches!(
            provider.download(&Paper::new("missing", "x")).await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[test]
    fn test_extract_metadata_rejects_bad_json() {
        let provider = JsonFilePaperProvider::new("unused.json");
        assert!(matches!(
            provider.extract_metadata("{not json"),
            Err(ProviderError::ParseError(_))
        ));
        let papers = provider.extract_metadata(r#"[{"id": "a", "title": "T"}]"#).unwrap();
        assert_eq!(papers[0].id, "a");
    }
}
