//! Core data models for the scholar index.
//!
//! This module contains the data structures shared across the application:
//! paper metadata, author information, and search hits returned by the
//! multi-instance vector store.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Represents a single author with their affiliation information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Author {
    /// Full name of the author
    pub name: String,

    /// Institutional affiliation (e.g., university, research lab)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affiliation: None,
        }
    }
}

/// Core metadata for a scholarly paper.
///
/// Papers are produced by a paper source on discovery and stamped with the
/// owning instance by the downloader. Once stored they are never mutated:
/// the `instance_name` of a stored paper always matches the collection its
/// chunks live in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Paper {
    /// Source-stable identifier (e.g. `2401.01234` for arXiv, `v108i03` for JSS)
    pub id: String,

    /// Paper title
    pub title: String,

    /// List of authors with their affiliations
    #[serde(default)]
    pub authors: Vec<Author>,

    /// Abstract text
    #[serde(default)]
    pub abstract_text: String,

    /// Subject categories (e.g. `cs.LG`, `q-fin.ST`)
    #[serde(default)]
    pub categories: Vec<String>,

    /// Journal name, for journal sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,

    /// Year of publication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_year: Option<i32>,

    /// Publication date, when the source provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<NaiveDate>,

    /// Where the full text can be downloaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,

    /// Name of the source that discovered the paper
    #[serde(default)]
    pub source: String,

    /// Owning instance; empty until the downloader assigns one
    #[serde(default)]
    pub instance_name: String,
}

impl Paper {
    /// Create a paper with the required fields; everything else empty.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            authors: Vec::new(),
            abstract_text: String::new(),
            categories: Vec::new(),
            journal: None,
            publish_year: None,
            published: None,
            pdf_url: None,
            source: String::new(),
            instance_name: String::new(),
        }
    }

    pub fn with_instance(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = instance_name.into();
        self
    }

    pub fn with_abstract(mut self, abstract_text: impl Into<String>) -> Self {
        self.abstract_text = abstract_text.into();
        self
    }

    pub fn with_authors(mut self, names: &[&str]) -> Self {
        self.authors = names.iter().map(|n| Author::new(*n)).collect();
        self
    }

    /// Comma-separated author names, as stored in chunk metadata.
    pub fn author_names(&self) -> String {
        self.authors
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Text used to compare whole papers: title followed by abstract.
    pub fn similarity_text(&self) -> String {
        if self.abstract_text.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.abstract_text)
        }
    }
}

/// Relevance classification for search results.
///
/// Hits are categorized by their semantic similarity to the query,
/// allowing clients to understand the quality of matches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceLevel {
    /// Extremely high similarity (cosine similarity > 0.95)
    Identical,

    /// Very high similarity (cosine similarity > 0.85)
    HighlySimilar,

    /// Moderate similarity (cosine similarity > 0.70)
    Similar,

    /// Anything lower
    Relevant,
}

impl RelevanceLevel {
    /// Determine relevance level from a cosine similarity score.
    ///
    /// # Arguments
    /// * `score` - Cosine similarity score between -1.0 and 1.0
    ///
    /// # Returns
    /// The appropriate relevance level for the given score
    pub fn from_score(score: f32) -> Self {
        if score > 0.95 {
            RelevanceLevel::Identical
        } else if score > 0.85 {
            RelevanceLevel::HighlySimilar
        } else if score > 0.70 {
            RelevanceLevel::Similar
        } else {
            RelevanceLevel::Relevant
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RelevanceLevel::Identical => "Identical",
            RelevanceLevel::HighlySimilar => "Highly Similar",
            RelevanceLevel::Similar => "Similar",
            RelevanceLevel::Relevant => "Relevant",
        }
    }
}

/// A single chunk-level search hit.
///
/// This is the primary output type of instance and cross-instance search,
/// combining the stored chunk with its score and provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    /// Id of the matching chunk
    pub chunk_id: String,

    /// Chunk text
    pub content: String,

    /// Instance the chunk belongs to
    pub instance_name: String,

    /// Paper the chunk was cut from
    pub paper_id: String,

    /// Title of that paper
    pub title: String,

    /// Depth of the chunk in its tree (0 is the finest)
    pub chunk_level: usize,

    /// Cosine similarity to the query
    pub relevance_score: f32,

    /// Categorical relevance classification
    pub relevance: RelevanceLevel,

    /// 1-based rank across all instances; only set by cross-instance search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_rank: Option<usize>,

    /// Full stored metadata of the chunk
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
