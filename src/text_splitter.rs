//! Separator-aware recursive splitting.
//!
//! A chunk ends at the furthest split point of the coarsest separator level
//! that fits the window, and the next chunk starts `overlap_size` characters
//! before that end. Tokens with no separator inside the window are never cut.
//! If the only split points fall inside the overlap, the text before them is
//! cut off and the overlap is shortened there. Otherwise the chunk is
//! extended to the next separator, so a single token longer than
//! `chunk_size` becomes one oversized chunk.

use crate::chunking::{Chunk, ChunkingConfig, ChunkingStrategy, char_boundaries};

/// A literal separator. The split point falls after the separator's leading
/// non-whitespace characters, so `". "` keeps the period with the sentence
/// it ends and `"\n\n"` is left out of both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Separator {
    pattern: Vec<char>,
    keep: usize,
}

impl Separator {
    fn new(pattern: &str) -> Self {
        let pattern: Vec<char> = pattern.chars().collect();
        let keep = pattern.iter().take_while(|c| !c.is_whitespace()).count();
        Self { pattern, keep }
    }

    /// Whether splitting at char position `split` is allowed by this separator.
    fn splits_at(&self, chars: &[char], split: usize) -> bool {
        let Some(start) = split.checked_sub(self.keep) else {
            return false;
        };
        chars
            .get(start..start + self.pattern.len())
            .is_some_and(|window| window == self.pattern.as_slice())
    }
}

/// Splits on paragraphs, then lines, sentences and finally words.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    levels: Vec<Vec<Separator>>,
}

impl Default for RecursiveSplitter {
    fn default() -> Self {
        let level = |patterns: &[&str]| {
            patterns.iter().map(|p| Separator::new(p)).collect::<Vec<_>>()
        };
        Self {
            levels: vec![
                level(&["\n\n"]),
                level(&["\n"]),
                level(&[". ", "! ", "? "]),
                level(&[" ", "\t"]),
            ],
        }
    }
}

impl RecursiveSplitter {
    /// Use a custom separator list, coarsest first. Each separator forms its
    /// own level; empty separators are ignored. Leading punctuation of a
    /// separator stays with the text before the split.
    ///
    /// # Examples
    ///
    /// ```
    /// use magnet::{chunking::ChunkingStrategy, text_splitter::RecursiveSplitter};
    ///
    /// let splitter = RecursiveSplitter::with_separators(&["|", " "]);
    /// let chunks = splitter.chunk_text("aaa bbb|ccc ddd", 10, 0).unwrap();
    /// assert_eq!(chunks, vec!["aaa bbb|", "ccc ddd"]);
    /// ```
    pub fn with_separators(separators: &[&str]) -> Self {
        Self {
            levels: separators
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| vec![Separator::new(s)])
                .collect(),
        }
    }

    /// Furthest split point in `(start + overlap, start + chunk_size]`,
    /// trying coarser levels first.
    fn split_in_window(
        &self,
        chars: &[char],
        start: usize,
        config: &ChunkingConfig,
    ) -> Option<usize> {
        let lo = start + config.overlap_size();
        let hi = start + config.chunk_size();

        self.levels.iter().find_map(|level| {
            level
                .iter()
                .filter_map(|sep| {
                    (lo + 1..=hi).rev().find(|&p| sep.splits_at(chars, p))
                })
                .max()
        })
    }

    /// Furthest split point of any level in `(start, start + overlap]`.
    fn split_in_overlap(
        &self,
        chars: &[char],
        start: usize,
        config: &ChunkingConfig,
    ) -> Option<usize> {
        let lo = start + config.overlap_size();
        (start + 1..=lo.min(chars.len())).rev().find(|&p| {
            self.levels
                .iter()
                .flatten()
                .any(|sep| sep.splits_at(chars, p))
        })
    }

    /// Nearest split point of any level after `from`.
    fn next_split_after(&self, chars: &[char], from: usize) -> Option<usize> {
        (from + 1..chars.len()).find(|&p| {
            self.levels
                .iter()
                .flatten()
                .any(|sep| sep.splits_at(chars, p))
        })
    }
}

impl ChunkingStrategy for RecursiveSplitter {
    fn name(&self) -> &'static str {
        "recursive"
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

        let chars: Vec<char> = text.chars().collect();
        let skip_whitespace = |mut pos: usize| {
            while pos < char_count && chars[pos].is_whitespace() {
                pos += 1;
            }
            pos
        };
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut emitted_to = 0;

        while start < char_count {
            let end = if char_count - start <= config.chunk_size() {
                char_count
            } else if let Some(end) =
                self.split_in_window(&chars, start, config)
            {
                end
            } else if let Some(split) =
                self.split_in_overlap(&chars, start, config)
            {
                // Text up to an earlier chunk's end is already covered.
                if chunks.is_empty() || split > emitted_to {
                    chunks.push(Chunk {
                        text: text[bounds[start]..bounds[split]].to_string(),
                        index: chunks.len(),
                        start_offset: start,
                    });
                    emitted_to = split;
                }
                start = skip_whitespace(split);
                continue;
            } else {
                self.next_split_after(&chars, start + config.chunk_size())
                    .unwrap_or(char_count)
            };

            chunks.push(Chunk {
                text: text[bounds[start]..bounds[end]].to_string(),
                index: chunks.len(),
                start_offset: start,
            });
            emitted_to = end;

            if end == char_count {
                break;
            }

            start = end - config.overlap_size();
            if config.overlap_size() == 0 {
                start = skip_whitespace(start);
            }
        }

        chunks
    }
}
