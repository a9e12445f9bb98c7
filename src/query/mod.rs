//! Query parameters, similarity scoring and ranking.
//!
//! The vector backends score candidates with [`cosine_similarity`] and the
//! multi-instance store merges per-instance hit lists through
//! [`merge_global`], which produces the global ranking used by cross-instance
//! search.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::SearchHit;

/// Default number of results for a search.
pub const DEFAULT_N_RESULTS: usize = 10;

/// Upper bound on requested results.
pub const MAX_N_RESULTS: usize = 100;

/// Errors raised while validating a query.
#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    /// Query text is blank
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Requested result count outside `1..=MAX_N_RESULTS`
    #[error("Invalid result count {0}: must be between 1 and {max}", max = MAX_N_RESULTS)]
    InvalidResultCount(usize),
}

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Search query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// The search query text
    pub query: String,

    /// Maximum number of results to return
    #[serde(default = "default_n_results")]
    pub n_results: usize,
}

fn default_n_results() -> usize {
    DEFAULT_N_RESULTS
}

impl SearchQuery {
    /// Create a new search query.
    ///
    /// # Arguments
    /// * `query` - The search query text
    /// * `n_results` - Maximum number of results to return (default: 10)
    pub fn new(query: impl Into<String>, n_results: Option<usize>) -> Self {
        Self {
            query: query.into(),
            n_results: n_results.unwrap_or(DEFAULT_N_RESULTS),
        }
    }

    /// # Errors
    /// Returns `QueryError` for blank text or an out-of-range result count
    pub fn validate(&self) -> QueryResult<()> {
        if self.query.trim().is_empty() {
            return Err(QueryError::InvalidQuery("query text cannot be empty".to_string()));
        }
        if self.n_results == 0 || self.n_results > MAX_N_RESULTS {
            return Err(QueryError::InvalidResultCount(self.n_results));
        }
        Ok(())
    }
}

/// Compute cosine similarity between two vectors.
///
/// It ranges from -1 to 1, where 1 means the vectors point in the same
/// direction. Vectors of different lengths, or with zero magnitude, score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot_product / (norm_a * norm_b)
}

/// Descending score; ties broken by instance, then chunk id.
pub fn compare_hits(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.relevance_score
        .partial_cmp(&a.relevance_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.instance_name.cmp(&b.instance_name))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Merge per-instance result lists into one global ranking.
///
/// Hits are sorted with [`compare_hits`], truncated to `n_results` and
/// annotated with `global_rank` starting at 1.
pub fn merge_global(result_lists: Vec<Vec<SearchHit>>, n_results: usize) -> Vec<SearchHit> {
    let mut merged: Vec<SearchHit> = result_lists.into_iter().flatten().collect();
    merged.sort_by(compare_hits);
    merged.truncate(n_results);
    for (rank, hit) in merged.iter_mut().enumerate() {
        hit.global_rank = Some(rank + 1);
    }
    merged
}

/// Keep only the best-scoring chunk per `(instance, paper)`, preserving rank order.
pub fn best_per_paper(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut best: HashMap<(String, String), SearchHit> = HashMap::new();
    for hit in hits {
        let key = (hit.instance_name.clone(), hit.paper_id.clone());
        match best.get(&key) {
            Some(existing) if existing.relevance_score >= hit.relevance_score => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }
    let mut out: Vec<SearchHit> = best.into_values().collect();
    out.sort_by(compare_hits);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelevanceLevel;

    fn hit(instance: &str, paper: &str, chunk: &str, score: f32) -> SearchHit {
        SearchHit {
            chunk_id: chunk.to_string(),
            content: String::new(),
            instance_name: instance.to_string(),
            paper_id: paper.to_string(),
            title: String::new(),
            chunk_level: 0,
            relevance_score: score,
            relevance: RelevanceLevel::from_score(score),
            global_rank: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];
        let d = vec![-1.0, 0.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_search_query_defaults_and_validation() {
        let query = SearchQuery::new("transformers", None);
        assert_eq!(query.n_results, DEFAULT_N_RESULTS);
        assert!(query.validate().is_ok());

        assert!(matches!(
            SearchQuery::new("   ", None).validate(),
            Err(QueryError::InvalidQuery(_))
        ));
        assert_eq!(
            SearchQuery::new("x", Some(0)).validate(),
            Err(QueryError::InvalidResultCount(0))
        );
        assert!(SearchQuery::new("x", Some(MAX_N_RESULTS + 1)).validate().is_err());
    }

    #[test]
    fn test_merge_global_ranks_and_truncates() {
        let ai = vec![
            hit("ai_scholar", "p1", "p1_L0_C0", 0.9),
            hit("ai_scholar", "p1", "p1_L0_C1", 0.4),
        ];
        let quant = vec![hit("quant_scholar", "q1", "q1_L0_C0", 0.7)];

        let merged = merge_global(vec![ai, quant], 2);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].chunk_id, "p1_L0_C0");
        assert_eq!(merged[1].instance_name, "quant_scholar");
        assert_eq!(merged[0].global_rank, Some(1));
        assert_eq!(merged[1].global_rank, Some(2));
    }

    #[test]
    fn test_merge_global_tie_break_is_deterministic() {
        let a = vec![hit("b_inst", "x", "x_L0_C0", 0.5)];
        let b = vec![hit("a_inst", "y", "y_L0_C0", 0.5)];
        let merged = merge_global(vec![a, b], 10);
        assert_eq!(merged[0].instance_name, "a_inst");
        assert_eq!(merged[1].instance_name, "b_inst");
    }

    #[test]
    fn test_best_per_paper() {
        let hits = vec![
            hit("ai", "p1", "p1_L0_C0", 0.3),
            hit("ai", "p1", "p1_L0_C1", 0.8),
            hit("quant", "p1", "p1_L0_C0", 0.5),
            hit("ai", "p2", "p2_L0_C0", 0.6),
        ];
        let best = best_per_paper(hits);
        assert_eq!(best.len(), 3);
        assert_eq!(best[0].chunk_id, "p1_L0_C1");
        assert_eq!(best[1].paper_id, "p2");
        assert_eq!(best[2].instance_name, "quant");
    }
}
