//! Chunking strategies for splitting documents into bounded, overlapping
//! passages before they are encoded.
//!
//! Every strategy implements [`ChunkingStrategy`]. The lifecycle manager only
//! depends on that trait, so new strategies can be plugged in without
//! touching index construction. Two ship with the crate:
//!
//! - [`RecursiveSplitter`](crate::text_splitter::RecursiveSplitter): splits on
//!   paragraphs, then lines, sentences and words (the default).
//! - [`FixedWidthSplitter`]: hard character windows.
//!
//! Lengths are measured in characters (Unicode scalar values), not bytes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    text_splitter::RecursiveSplitter,
};

/// Default maximum document length used when building an index.
pub const DEFAULT_MAX_DOCUMENT_LENGTH: usize = 256;

/// Overlap used when chunking for an index of the given document length.
///
/// A quarter of the chunk size, rounded down.
pub fn overlap_for(max_document_length: usize) -> usize {
    max_document_length / 4
}

/// Validated chunk geometry.
///
/// # Examples
///
/// ```
/// use magnet::chunking::ChunkingConfig;
///
/// let config = ChunkingConfig::new(20, 5).unwrap();
/// assert_eq!(config.chunk_size(), 20);
/// assert_eq!(config.overlap_size(), 5);
///
/// assert!(ChunkingConfig::new(0, 0).is_err());
/// assert!(ChunkingConfig::new(10, 10).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    chunk_size: usize,
    overlap_size: usize,
}

impl ChunkingConfig {
    /// Requires `chunk_size > 0` and `overlap_size < chunk_size`.
    pub fn new(chunk_size: usize, overlap_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if overlap_size >= chunk_size {
            return Err(Error::Config(format!(
                "overlap_size ({overlap_size}) must be smaller than \
                 chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap_size,
        })
    }

    /// Geometry used for an index built with `max_document_length`.
    pub fn for_document_length(max_document_length: usize) -> Result<Self> {
        Self::new(max_document_length, overlap_for(max_document_length))
            .map_err(|_| {
                Error::Config(format!(
                    "max_document_length must be greater than zero, got \
                     {max_document_length}"
                ))
            })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap_size(&self) -> usize {
        self.overlap_size
    }
}

/// A chunk of text from a larger document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The chunk text content.
    pub text: String,
    /// Zero-based chunk index within the document.
    pub index: usize,
    /// Character offset where this chunk starts in the original document.
    pub start_offset: usize,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// A pluggable way of cutting documents into chunks.
pub trait ChunkingStrategy: Send + Sync + std::fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Split a single document.
    fn split(&self, text: &str, config: &ChunkingConfig) -> Vec<Chunk>;

    /// Chunk a collection and flatten the result, preserving order.
    ///
    /// The configuration is validated before any document is touched.
    ///
    /// # Examples
    ///
    /// ```
    /// use magnet::chunking::{ChunkingStrategy, FixedWidthSplitter};
    ///
    /// let docs = vec!["abcdefgh".to_string(), "xy".to_string()];
    /// let chunks = FixedWidthSplitter.chunk(&docs, 4, 0).unwrap();
    /// assert_eq!(chunks, vec!["abcd", "efgh", "xy"]);
    ///
    /// assert!(FixedWidthSplitter.chunk(&docs, 4, 4).is_err());
    /// ```
    fn chunk(
        &self,
        documents: &[String],
        chunk_size: usize,
        overlap_size: usize,
    ) -> Result<Vec<String>> {
        let config = ChunkingConfig::new(chunk_size, overlap_size)?;
        Ok(documents
            .iter()
            .flat_map(|doc| self.split(doc, &config))
            .map(|chunk| chunk.text)
            .collect())
    }

    /// Chunk a single document.
    fn chunk_text(
        &self,
        text: &str,
        chunk_size: usize,
        overlap_size: usize,
    ) -> Result<Vec<String>> {
        let config = ChunkingConfig::new(chunk_size, overlap_size)?;
        Ok(self
            .split(text, &config)
            .into_iter()
            .map(|chunk| chunk.text)
            .collect())
    }
}

/// Strategy selector, usable from configuration files.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ChunkerKind {
    #[default]
    Recursive,
    FixedWidth,
}

impl ChunkerKind {
    pub fn strategy(self) -> Arc<dyn ChunkingStrategy> {
        match self {
            Self::Recursive => Arc::new(RecursiveSplitter::default()),
            Self::FixedWidth => Arc::new(FixedWidthSplitter),
        }
    }
}

/// The strategy used when none is given.
pub fn default_strategy() -> Arc<dyn ChunkingStrategy> {
    ChunkerKind::default().strategy()
}

/// Splits on exact character windows, ignoring word boundaries.
///
/// Windows advance by `chunk_size - overlap_size`, so no chunk ever exceeds
/// `chunk_size`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWidthSplitter;

impl ChunkingStrategy for FixedWidthSplitter {
    fn name(&self) -> &'static str {
        "fixed_width"
    }

    fn split(&self, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
        let bounds = char_boundaries(text);
        let char_count = bounds.len() - 1;

        if char_count <= config.chunk_size() {
            return vec![Chunk {
                text: text.to_string(),
                index: 0,
                start_offset: 0,
            }];
        }

        let step = config.chunk_size() - config.overlap_size();
        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let end = (start + config.chunk_size()).min(char_count);
            chunks.push(Chunk {
                text: text[bounds[start]..bounds[end]].to_string(),
                index: chunks.len(),
                start_offset: start,
            });
            if end == char_count {
                break;
            }
            start += step;
        }

        chunks
    }
}

/// Byte offset of every char in `text`, followed by `text.len()`.
pub(crate) fn char_boundaries(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig::new(size, overlap).unwrap()
    }

    #[test]
    fn config_rejects_zero_chunk_size() {
        let err = ChunkingConfig::new(0, 0).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn config_rejects_overlap_not_smaller_than_chunk() {
        assert!(matches!(
            ChunkingConfig::new(10, 10),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ChunkingConfig::new(10, 25),
            Err(Error::Config(_))
        ));
        assert!(ChunkingConfig::new(10, 9).is_ok());
    }

    #[test]
    fn document_length_uses_quarter_overlap() {
        let config = ChunkingConfig::for_document_length(180).unwrap();
        assert_eq!(config.chunk_size(), 180);
        assert_eq!(config.overlap_size(), 45);

        let tiny = ChunkingConfig::for_document_length(3).unwrap();
        assert_eq!(tiny.overlap_size(), 0);

        let err = ChunkingConfig::for_document_length(0).unwrap_err();
        assert!(err.to_string().contains("max_document_length"));
    }

    #[test]
    fn fixed_width_short_text_single_chunk() {
        let chunks = FixedWidthSplitter.split("Hello, world!", &config(100, 10));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].start_offset, 0);
    }

    #[test]
    fn fixed_width_windows_overlap_exactly() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = FixedWidthSplitter.split(text, &config(10, 3));

        for chunk in &chunks {
            assert!(chunk.char_len() <= 10);
        }
        for pair in chunks.windows(2) {
            let tail: String = pair[0].text.chars().skip(7).collect();
            assert!(pair[1].text.starts_with(&tail));
        }
        assert_eq!(chunks.last().unwrap().text, "vwxyz");
    }

    #[test]
    fn fixed_width_handles_multibyte_chars() {
        let text = "café ☕ naïve 日本語 🎉 ".repeat(20);
        let chunks = FixedWidthSplitter.split(&text, &config(30, 5));

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.char_len() <= 30);
        }
    }

    #[test]
    fn chunk_flattens_in_order() {
        let docs = vec![
            "first document".to_string(),
            "second".to_string(),
        ];
        let chunks = FixedWidthSplitter.chunk(&docs, 8, 2).unwrap();
        assert_eq!(chunks.first().unwrap(), "first do");
        assert_eq!(chunks.last().unwrap(), "second");
    }

    #[test]
    fn chunk_validates_before_work() {
        let docs = vec!["anything".to_string()];
        assert!(matches!(
            FixedWidthSplitter.chunk(&docs, 5, 7),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn chunker_kind_selects_strategy() {
        assert_eq!(ChunkerKind::Recursive.strategy().name(), "recursive");
        assert_eq!(ChunkerKind::FixedWidth.strategy().name(), "fixed_width");
        assert_eq!(default_strategy().name(), "recursive");
    }

    #[test]
    fn chunker_kind_deserializes_snake_case() {
        let kind: ChunkerKind =
            serde_json::from_str("\"fixed_width\"").unwrap();
        assert_eq!(kind, ChunkerKind::FixedWidth);
    }
}
