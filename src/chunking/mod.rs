//! Hierarchical, overlap-aware document chunking.
//!
//! Level 0 holds the finest chunks, cut at sentence boundaries and bounded by
//! `base_chunk_size`. Each higher level groups runs of chunks from the level
//! below into a parent covering exactly their span, so a chunk tree can be
//! walked from a coarse match down to the sentences that produced it.
//!
//! Chunk offsets are byte offsets into the source text and
//! `chunk.content == text[chunk.start_offset..chunk.end_offset]` always holds.
//! Neighbouring chunks of one level share `overlap_end` / `overlap_start` bytes.

mod sentences;

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use sentences::{
    ceil_char_boundary, floor_char_boundary, sentence_ends, sentence_units, split_oversized,
    trimmed_bounds,
};

/// Errors that can occur while chunking a document.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// The document has no non-whitespace content
    #[error("Document '{0}' is empty")]
    EmptyDocument(String),

    /// The document id is blank
    #[error("Document id cannot be empty")]
    MissingDocumentId,

    /// The chunker configuration is inconsistent
    #[error("Invalid chunker configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for chunking operations.
pub type ChunkingResult<T> = Result<T, ChunkingError>;

/// How level 0 is cut and whether higher levels are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    /// Sentence-aware level 0 with fixed-size grouping above it
    #[default]
    Hierarchical,
    /// Level-0 size and group size scaled to the document
    Adaptive,
    /// Flat sentence packing, no higher levels
    SentenceAware,
    /// Flat fixed-size character windows, no higher levels
    FixedSize,
}

impl ChunkingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingStrategy::Hierarchical => "hierarchical",
            ChunkingStrategy::Adaptive => "adaptive",
            ChunkingStrategy::SentenceAware => "sentence_aware",
            ChunkingStrategy::FixedSize => "fixed_size",
        }
    }

    fn builds_levels(&self) -> bool {
        matches!(self, ChunkingStrategy::Hierarchical | ChunkingStrategy::Adaptive)
    }
}

/// Chunker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Chunking strategy
    pub strategy: ChunkingStrategy,

    /// Upper bound for level-0 chunks, in bytes
    pub base_chunk_size: usize,

    /// Fraction of `base_chunk_size` neighbouring chunks may share
    pub overlap_percentage: f64,

    /// Maximum number of levels, level 0 included
    pub max_levels: usize,

    /// Children per parent for fixed grouping
    pub group_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::Hierarchical,
            base_chunk_size: 1000,
            overlap_percentage: 0.1,
            max_levels: 3,
            group_size: 3,
        }
    }
}

impl ChunkerConfig {
    /// Default configuration with a custom chunk size.
    pub fn with_chunk_size(base_chunk_size: usize) -> Self {
        Self {
            base_chunk_size,
            ..Self::default()
        }
    }

    /// Maximum number of bytes two neighbouring chunks may share.
    pub fn overlap_budget(&self) -> usize {
        (self.base_chunk_size as f64 * self.overlap_percentage).floor() as usize
    }

    /// # Errors
    /// Returns `ChunkingError::InvalidConfig` describing the first bad field
    pub fn validate(&self) -> ChunkingResult<()> {
        if self.base_chunk_size < 16 {
            return Err(ChunkingError::InvalidConfig(format!(
                "base_chunk_size must be at least 16, got {}",
                self.base_chunk_size
            )));
        }
        if !(0.0..0.5).contains(&self.overlap_percentage) {
            return Err(ChunkingError::InvalidConfig(format!(
                "overlap_percentage must be within [0, 0.5), got {}",
                self.overlap_percentage
            )));
        }
        if self.max_levels == 0 {
            return Err(ChunkingError::InvalidConfig("max_levels must be at least 1".to_string()));
        }
        if self.group_size < 2 {
            return Err(ChunkingError::InvalidConfig("group_size must be at least 2".to_string()));
        }
        Ok(())
    }
}

/// A node of the chunk tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{document_id}_L{level}_C{index}`
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// Depth in the tree; 0 is the finest level
    pub level: usize,
    /// Position within its level
    pub index: usize,
    pub parent_chunk_id: Option<String>,
    pub child_chunk_ids: Vec<String>,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Leading bytes shared with the previous chunk of the same level
    pub overlap_start: usize,
    /// Trailing bytes shared with the next chunk of the same level
    pub overlap_end: usize,
    /// Sentence end offsets relative to `content`
    pub sentence_boundaries: Vec<usize>,
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    pub fn chunk_id(document_id: &str, level: usize, index: usize) -> String {
        format!("{}_L{}_C{}", document_id, level, index)
    }

    pub fn has_overlap(&self) -> bool {
        self.overlap_start > 0 || self.overlap_end > 0
    }

    pub fn len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.start_offset == self.end_offset
    }
}

/// Splits documents into multi-level chunk trees.
#[derive(Debug, Clone, Default)]
pub struct HierarchicalChunker {
    config: ChunkerConfig,
}

impl HierarchicalChunker {
    /// Create a chunker with a validated configuration.
    ///
    /// # Errors
    /// Returns `ChunkingError::InvalidConfig` if the configuration is inconsistent
    pub fn new(config: ChunkerConfig) -> ChunkingResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk a document with this chunker's configuration.
    ///
    /// # Arguments
    /// * `document_id` - Id of the paper the text belongs to
    /// * `text` - Full document text
    ///
    /// # Returns
    /// All chunks, level 0 first, each level ordered by index
    ///
    /// # Errors
    /// Returns `ChunkingError::EmptyDocument` for blank text
    pub fn chunk_document(&self, document_id: &str, text: &str) -> ChunkingResult<Vec<Chunk>> {
        chunk_with(&self.config, document_id, text)
    }
}

/// Chunk a document with an explicit configuration.
///
/// # Errors
/// Returns `ChunkingError` for an invalid configuration, a blank document id,
/// or blank text
pub fn chunk_with(
    config: &ChunkerConfig,
    document_id: &str,
    text: &str,
) -> ChunkingResult<Vec<Chunk>> {
    config.validate()?;
    if document_id.trim().is_empty() {
        return Err(ChunkingError::MissingDocumentId);
    }
    let (start, end) =
        trimmed_bounds(text).ok_or_else(|| ChunkingError::EmptyDocument(document_id.to_string()))?;

    let sentences = sentence_units(text, start, end);
    let ends = sentence_ends(text, &sentences);

    let level0 = match config.strategy {
        ChunkingStrategy::FixedSize => {
            fixed_windows(text, start, end, config.base_chunk_size, config.overlap_budget())
        }
        ChunkingStrategy::Adaptive => {
            let size = adaptive_chunk_size(config, &sentences);
            pack_units(text, split_oversized(text, sentences, size), size, config.overlap_budget())
        }
        ChunkingStrategy::Hierarchical | ChunkingStrategy::SentenceAware => pack_units(
            text,
            split_oversized(text, sentences, config.base_chunk_size),
            config.base_chunk_size,
            config.overlap_budget(),
        ),
    };

    let mut levels: Vec<Vec<Chunk>> =
        vec![materialize(text, document_id, 0, &level0, &ends, config.strategy)];

    if config.strategy.builds_levels() {
        while levels.len() < config.max_levels {
            let below = levels.last().map(Vec::len).unwrap_or(0);
            if below <= 1 {
                break;
            }
            let group_size = match config.strategy {
                ChunkingStrategy::Adaptive => adaptive_group_size(config, below),
                _ => config.group_size,
            };
            let level = levels.len();
            let (parents, groups) = {
                let children = &levels[level - 1];
                let groups = group_ranges(children.len(), group_size);
                let spans: Vec<Range<usize>> = groups
                    .iter()
                    .map(|g| children[g.start].start_offset..children[g.end - 1].end_offset)
                    .collect();
                (materialize(text, document_id, level, &spans, &ends, config.strategy), groups)
            };
            link_level(&mut levels[level - 1], &parents, &groups);
            let parents = attach_children(parents, &levels[level - 1], &groups);
            levels.push(parents);
        }
    }

    let chunks: Vec<Chunk> = levels.into_iter().flatten().collect();
    debug!(
        document_id = %document_id,
        strategy = config.strategy.as_str(),
        chunks = chunks.len(),
        "Chunked document"
    );
    Ok(chunks)
}

/// Greedily pack contiguous units into spans of at most `max` bytes.
///
/// The next span restarts at the earliest trailing units of the previous one
/// that fit in `overlap_budget`. When no whole unit fits, it restarts at the
/// earliest word boundary inside the budget instead. Either way the next span
/// must still take at least one new unit, and a span never restarts at its
/// own first byte.
fn pack_units(
    text: &str,
    units: Vec<Range<usize>>,
    max: usize,
    overlap_budget: usize,
) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let n = units.len();
    if n == 0 {
        return spans;
    }
    let mut span_start = units[0].start;
    let mut first = 0;

    loop {
        let mut last = first;
        while last + 1 < n && units[last + 1].end - span_start <= max {
            last += 1;
        }
        spans.push(span_start..units[last].end);
        if last + 1 >= n {
            break;
        }

        let next_end = units[last + 1].end;
        let shared_end = units[last].end;
        let whole_unit = (first..=last).find(|&k| {
            units[k].start > span_start
                && shared_end - units[k].start <= overlap_budget
                && next_end - units[k].start <= max
        });

        match whole_unit {
            Some(k) => {
                span_start = units[k].start;
                first = k;
            }
            None => {
                let lower = shared_end
                    .saturating_sub(overlap_budget)
                    .max(next_end.saturating_sub(max))
                    .max(span_start + 1);
                span_start =
                    word_start_within(text, lower, shared_end).unwrap_or(units[last + 1].start);
                first = last + 1;
            }
        }
    }
    spans
}

/// First byte in `lower..upper` that starts a word.
fn word_start_within(text: &str, lower: usize, upper: usize) -> Option<usize> {
    if lower >= upper {
        return None;
    }
    let lower = ceil_char_boundary(text, lower);
    let bytes = text.as_bytes();
    (lower..upper).find(|&p| {
        text.is_char_boundary(p)
            && bytes[p - 1].is_ascii_whitespace()
            && !bytes[p].is_ascii_whitespace()
    })
}

/// Fixed windows of `size` bytes snapped to character boundaries, each
/// sharing `overlap` bytes with its predecessor.
fn fixed_windows(
    text: &str,
    start: usize,
    end: usize,
    size: usize,
    overlap: usize,
) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut window_start = start;
    loop {
        let mut window_end = floor_char_boundary(text, (window_start + size).min(end));
        if window_end <= window_start {
            window_end = ceil_char_boundary(text, window_start + 1).min(end);
        }
        spans.push(window_start..window_end);
        if window_end >= end {
            break;
        }
        let mut next = ceil_char_boundary(text, window_end.saturating_sub(overlap));
        if next <= window_start || next > window_end {
            next = window_end;
        }
        window_start = next;
    }
    spans
}

fn adaptive_chunk_size(config: &ChunkerConfig, sentences: &[Range<usize>]) -> usize {
    let base = config.base_chunk_size;
    if sentences.is_empty() {
        return base;
    }
    let average = sentences.iter().map(|s| s.len()).sum::<usize>() / sentences.len();
    // Level 0 never grows past the base size; short sentences shrink it
    if average * 20 < base {
        (base * 3 / 4).max(16)
    } else {
        base
    }
}

fn adaptive_group_size(config: &ChunkerConfig, width: usize) -> usize {
    let root = (width as f64).sqrt().ceil() as usize;
    root.clamp(2, config.group_size.max(2) * 2)
}

/// Consecutive index ranges of `group_size`; a trailing single-element
/// group is folded into its predecessor.
fn group_ranges(len: usize, group_size: usize) -> Vec<Range<usize>> {
    let mut groups: Vec<Range<usize>> = (0..len)
        .step_by(group_size)
        .map(|start| start..(start + group_size).min(len))
        .collect();
    if groups.len() > 1 && groups.last().map(|g| g.len()) == Some(1) {
        if let Some(tail) = groups.pop() {
            if let Some(previous) = groups.last_mut() {
                previous.end = tail.end;
            }
        }
    }
    groups
}

fn materialize(
    text: &str,
    document_id: &str,
    level: usize,
    spans: &[Range<usize>],
    sentence_ends: &[usize],
    strategy: ChunkingStrategy,
) -> Vec<Chunk> {
    spans
        .iter()
        .enumerate()
        .map(|(index, span)| {
            let overlap_start = match index {
                0 => 0,
                _ => spans[index - 1].end.saturating_sub(span.start),
            };
            let overlap_end = spans
                .get(index + 1)
                .map(|next| span.end.saturating_sub(next.start))
                .unwrap_or(0);
            let content = &text[span.clone()];

            let mut metadata = BTreeMap::new();
            metadata.insert("strategy".to_string(), strategy.as_str().to_string());
            metadata.insert(
                "word_count".to_string(),
                content.split_whitespace().count().to_string(),
            );

            Chunk {
                id: Chunk::chunk_id(document_id, level, index),
                document_id: document_id.to_string(),
                content: content.to_string(),
                level,
                index,
                parent_chunk_id: None,
                child_chunk_ids: Vec::new(),
                start_offset: span.start,
                end_offset: span.end,
                overlap_start,
                overlap_end,
                sentence_boundaries: sentence_ends
                    .iter()
                    .filter(|&&e| e > span.start && e <= span.end)
                    .map(|e| e - span.start)
                    .collect(),
                metadata,
            }
        })
        .collect()
}

fn link_level(children: &mut [Chunk], parents: &[Chunk], groups: &[Range<usize>]) {
    for (parent, group) in parents.iter().zip(groups) {
        for child in &mut children[group.clone()] {
            child.parent_chunk_id = Some(parent.id.clone());
        }
    }
}

fn attach_children(
    mut parents: Vec<Chunk>,
    children: &[Chunk],
    groups: &[Range<usize>],
) -> Vec<Chunk> {
    for (parent, group) in parents.iter_mut().zip(groups) {
        parent.child_chunk_ids = children[group.clone()].iter().map(|c| c.id.clone()).collect();
    }
    parents
}
