//! Application configuration.
//!
//! Settings load from a TOML file, then environment variables override a
//! handful of deployment-specific keys:
//!
//! | Variable | Key |
//! |---|---|
//! | `SCHOLAR_STORAGE_BACKEND` | `storage.backend` (`memory` or `sqlite`) |
//! | `SCHOLAR_SQLITE_PATH` | `storage.sqlite_path` |
//! | `SCHOLAR_METADATA_DIR` | `storage.metadata_dir` |
//! | `SCHOLAR_EMBEDDING_MODEL` | `embedding.default_model` |
//! | `SCHOLAR_MAX_CONCURRENT_DOWNLOADS` | `downloader.max_concurrent_downloads` |
//! | `OPENAI_API_KEY` | `embedding.openai_api_key` |
//!
//! ```toml
//! [storage]
//! backend = "sqlite"
//! sqlite_path = "/var/lib/scholar/vectors.db"
//!
//! [chunker]
//! base_chunk_size = 1000
//!
//! [[instances]]
//! name = "ai_scholar"
//! categories = ["cs.AI", "cs.LG"]
//!
//! [[instances]]
//! name = "quant_scholar"
//! chunk_size = 800
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::chunking::{ChunkerConfig, ChunkingStrategy};
use crate::collection::validate_instance_name;
use crate::provider::{HttpSettings, SourceKind};
use crate::resilience::{CircuitBreakerConfig, ClassifierConfig, RetryPolicies};
use crate::vector_store::InstanceConfig;

const APP_DIR: &str = "scholar-index";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Default location of embedding model files.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    Memory,
    Sqlite,
}

impl std::str::FromStr for StorageBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackendKind::Memory),
            "sqlite" => Ok(StorageBackendKind::Sqlite),
            other => Err(ConfigError::Invalid(format!(
                "unknown storage backend '{}', expected memory or sqlite",
                other
            ))),
        }
    }
}

/// Where vectors and paper metadata are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackendKind,

    /// SQLite database file, for the `sqlite` backend
    pub sqlite_path: PathBuf,

    /// Directory of per-instance paper JSON files; in memory when unset
    pub metadata_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let root = data_dir();
        Self {
            backend: StorageBackendKind::Sqlite,
            sqlite_path: root.join("vectors.db"),
            metadata_dir: Some(root.join("papers")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Model for instances that do not name one
    pub default_model: String,

    pub openai_api_key: Option<String>,

    pub openai_base_url: Option<String>,

    /// Model file cache for local models
    pub cache_dir: Option<PathBuf>,

    /// Texts per provider call
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            default_model: crate::DEFAULT_EMBEDDING_MODEL.to_string(),
            openai_api_key: None,
            openai_base_url: None,
            cache_dir: None,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub retry: RetryPolicies,

    pub circuit_breaker: CircuitBreakerConfig,

    pub classifier: ClassifierConfig,

    /// Where the error report is written on shutdown
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderSettings {
    pub max_concurrent_downloads: usize,

    pub batch_size: usize,

    /// Papers discovered per run unless the caller overrides it
    pub max_papers: usize,

    /// Extracted texts shorter than this count as empty
    pub min_text_len: usize,

    /// Earliest publication date to discover
    pub date_from: Option<NaiveDate>,

    /// Latest publication date to discover
    pub date_to: Option<NaiveDate>,

    pub source: SourceKind,

    pub http: HttpSettings,
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            batch_size: 10,
            max_papers: 100,
            min_text_len: 200,
            date_from: None,
            date_to: None,
            source: SourceKind::Arxiv { api_url: None },
            http: HttpSettings::default(),
        }
    }
}

/// One `[[instances]]` entry.
///
/// Unset chunking fields fall back to the `[chunker]` section, and an unset
/// model falls back to `embedding.default_model`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub name: String,

    /// Source categories ingested into this instance
    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default)]
    pub embedding_model: Option<String>,

    #[serde(default)]
    pub chunk_size: Option<usize>,

    #[serde(default)]
    pub chunk_overlap: Option<usize>,

    #[serde(default)]
    pub strategy: Option<ChunkingStrategy>,

    #[serde(default)]
    pub description: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageSettings,
    pub embedding: EmbeddingSettings,
    pub resilience: ResilienceSettings,
    pub downloader: DownloaderSettings,
    pub chunker: ChunkerConfig,
    pub instances: Vec<InstanceEntry>,
}

impl AppConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` for malformed TOML or unknown values
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read, or `ConfigError::Parse`
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&raw)
    }

    /// File (or defaults), then environment overrides, then validation.
    ///
    /// # Errors
    /// Returns the first load, override or validation error
    pub fn resolve(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for unparseable values
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for unparseable values
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = get("SCHOLAR_STORAGE_BACKEND") {
            self.storage.backend = backend.parse()?;
        }
        if let Some(path) = get("SCHOLAR_SQLITE_PATH") {
            self.storage.sqlite_path = PathBuf::from(path);
        }
        if let Some(dir) = get("SCHOLAR_METADATA_DIR") {
            self.storage.metadata_dir = Some(PathBuf::from(dir));
        }
        if let Some(model) = get("SCHOLAR_EMBEDDING_MODEL") {
            self.embedding.default_model = model;
        }
        if let Some(raw) = get("SCHOLAR_MAX_CONCURRENT_DOWNLOADS") {
            self.downloader.max_concurrent_downloads = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "SCHOLAR_MAX_CONCURRENT_DOWNLOADS must be a number, got '{}'",
                    raw
                ))
            })?;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.embedding.openai_api_key = Some(key);
        }
        Ok(())
    }

    /// Resolved per-instance settings, in declaration order.
    pub fn instance_configs(&self) -> Vec<(String, InstanceConfig)> {
        self.instances
            .iter()
            .map(|entry| (entry.name.clone(), self.resolve_instance(entry)))
            .collect()
    }

    /// Entry for `name`, if configured.
    pub fn instance(&self, name: &str) -> Option<&InstanceEntry> {
        self.instances.iter().find(|e| e.name == name)
    }

    fn resolve_instance(&self, entry: &InstanceEntry) -> InstanceConfig {
        let chunk_size = entry.chunk_size.unwrap_or(self.chunker.base_chunk_size);
        let default_overlap =
            (chunk_size as f64 * self.chunker.overlap_percentage).floor() as usize;
        InstanceConfig {
            embedding_model: entry
                .embedding_model
                .clone()
                .unwrap_or_else(|| self.embedding.default_model.clone()),
            chunk_size,
            chunk_overlap: entry.chunk_overlap.unwrap_or(default_overlap),
            strategy: entry.strategy.unwrap_or(self.chunker.strategy),
            description: entry.description.clone(),
        }
    }

    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first problem found
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| ConfigError::Invalid(msg);

        if self.embedding.default_model.trim().is_empty() {
            return Err(invalid("embedding.default_model cannot be empty".to_string()));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be at least 1".to_string()));
        }
        if self.downloader.max_concurrent_downloads == 0 {
            return Err(invalid(
                "downloader.max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.downloader.batch_size == 0 {
            return Err(invalid("downloader.batch_size must be at least 1".to_string()));
        }
        if let (Some(from), Some(to)) = (self.downloader.date_from, self.downloader.date_to) {
            if from > to {
                return Err(invalid(format!(
                    "downloader.date_from {} is after date_to {}",
                    from, to
                )));
            }
        }
        if self.storage.backend == StorageBackendKind::Sqlite
            && self.storage.sqlite_path.as_os_str().is_empty()
        {
            return Err(invalid(
                "storage.sqlite_path is required for the sqlite backend".to_string(),
            ));
        }

        self.resilience.retry.validate().map_err(invalid)?;
        self.resilience
            .circuit_breaker
            .validate()
            .map_err(|e| invalid(format!("circuit_breaker: {}", e)))?;
        self.resilience
            .classifier
            .validate()
            .map_err(|e| invalid(format!("classifier: {}", e)))?;
        self.chunker
            .validate()
            .map_err(|e| invalid(format!("chunker: {}", e)))?;

        let mut seen = HashSet::new();
        for entry in &self.instances {
            validate_instance_name(&entry.name).map_err(|e| invalid(e.to_string()))?;
            if !seen.insert(entry.name.as_str()) {
                return Err(invalid(format!("instance '{}' is configured twice", entry.name)));
            }
            self.resolve_instance(entry)
                .validate()
                .map_err(|e| invalid(format!("instance '{}': {}", entry.name, e)))?;
        }
        Ok(())
    }
}
