//! The retrieval model seam.
//!
//! [`NeuralSearch`](crate::NeuralSearch) never encodes or ranks anything
//! itself. It hands passages and queries to a [`RetrievalModel`], which owns
//! the persisted index structures. [`ColbertModel`](crate::ColbertModel) is
//! the production implementation; [`InMemoryModel`](crate::InMemoryModel)
//! keeps everything in RAM.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    corpus::Passage,
    error::{Error, Result},
};

/// Checkpoint configuration of a retrieval model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    /// Maximum document length. Tracks the bound index once one is bound.
    pub doc_maxlen: usize,
}

/// A persisted, named index as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRef {
    pub name: String,
    pub path: PathBuf,
    pub doc_maxlen: usize,
    pub num_passages: usize,
    pub num_documents: usize,
}

/// One ranked passage returned by a model. Ranks are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub passage_id: u64,
    pub document_id: String,
    pub content: String,
    pub score: f32,
    pub rank: usize,
}

/// Per-call search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub k: usize,
    /// Trade recall for speed where the model supports it.
    pub force_fast: bool,
    /// Model-specific options. Unknown keys are rejected.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            k: 10,
            force_fast: false,
            extra: BTreeMap::new(),
        }
    }
}

/// A model that builds, extends and searches named indexes.
pub trait RetrievalModel {
    fn config(&self) -> &ModelConfig;

    /// The index this model is currently attached to.
    fn bound_index(&self) -> Option<&IndexRef>;

    /// Storage location of the index called `name`. Also the key used to
    /// serialize writers.
    fn index_path(&self, name: &str) -> PathBuf;

    fn index_exists(&self, name: &str) -> bool;

    /// File whose exclusive lock keeps writers in other processes out of
    /// `name`. Models without shared storage need none.
    fn lock_file(&self, _name: &str) -> Option<PathBuf> {
        None
    }

    /// Attach to an existing index without modifying it.
    fn open_index(&mut self, name: &str) -> Result<IndexRef>;

    /// Build the index `name` from scratch and attach to it.
    ///
    /// With `overwrite == false` an existing index of that name is an
    /// [`Error::IndexExists`].
    fn index(
        &mut self,
        passages: &[Passage],
        name: &str,
        max_document_length: usize,
        overwrite: bool,
    ) -> Result<IndexRef>;

    /// Append passages to the existing index `name`.
    fn add_to_index(&mut self, passages: &[Passage], name: &str) -> Result<()>;

    /// Rank passages of `name` for every query, in query order.
    fn search(
        &mut self,
        queries: &[String],
        name: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Vec<ScoredPassage>>>;
}

/// Options every model understands in [`SearchOptions::extra`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct CommonExtras {
    pub min_score: Option<f32>,
    pub fast_candidates: Option<usize>,
}

impl CommonExtras {
    /// Parse the keys listed in `allowed`; any other key is a config error.
    pub(crate) fn parse(
        extra: &BTreeMap<String, serde_json::Value>,
        allowed: &[&str],
    ) -> Result<Self> {
        let mut parsed = Self::default();
        for (key, value) in extra {
            if !allowed.contains(&key.as_str()) {
                return Err(Error::Config(format!(
                    "unsupported search option '{key}'"
                )));
            }
            match key.as_str() {
                "min_score" => {
                    let score = value.as_f64().ok_or_else(|| {
                        Error::Config("min_score must be a number".into())
                    })?;
                    parsed.min_score = Some(score as f32);
                }
                "fast_candidates" => {
                    let n = value
                        .as_u64()
                        .filter(|&n| n > 0)
                        .ok_or_else(|| {
                            Error::Config(
                                "fast_candidates must be a positive integer"
                                    .into(),
                            )
                        })?;
                    parsed.fast_candidates = Some(n as usize);
                }
                _ => {}
            }
        }
        Ok(parsed)
    }
}

/// Sort by descending score, apply the score floor, keep `k` and assign
/// 1-based ranks.
pub(crate) fn finalize_ranking(
    mut hits: Vec<ScoredPassage>,
    k: usize,
    min_score: Option<f32>,
) -> Vec<ScoredPassage> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.passage_id.cmp(&b.passage_id))
    });

    hits.into_iter()
        .filter(|hit| min_score.is_none_or(|floor| hit.score >= floor))
        .take(k)
        .enumerate()
        .map(|(i, mut hit)| {
            hit.rank = i + 1;
            hit
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn hit(passage_id: u64, score: f32) -> ScoredPassage {
        ScoredPassage {
            passage_id,
            document_id: passage_id.to_string(),
            content: String::new(),
            score,
            rank: 0,
        }
    }

    #[test]
    fn ranking_sorts_truncates_and_numbers_from_one() {
        let ranked = finalize_ranking(
            vec![hit(1, 0.2), hit(2, 0.9), hit(3, 0.5), hit(4, 0.1)],
            3,
            None,
        );
        let summary: Vec<_> =
            ranked.iter().map(|h| (h.passage_id, h.rank)).collect();
        assert_eq!(summary, vec![(2, 1), (3, 2), (1, 3)]);
    }

    #[test]
    fn ranking_ties_break_on_passage_id() {
        let ranked =
            finalize_ranking(vec![hit(7, 1.0), hit(3, 1.0)], 10, None);
        assert_eq!(ranked[0].passage_id, 3);
    }

    #[test]
    fn ranking_applies_score_floor() {
        let ranked =
            finalize_ranking(vec![hit(1, 0.2), hit(2, 0.9)], 10, Some(0.5));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].passage_id, 2);
    }

    #[test]
    fn extras_parse_known_keys() {
        let extra = BTreeMap::from([
            ("min_score".to_string(), json!(0.25)),
            ("fast_candidates".to_string(), json!(128)),
        ]);
        let parsed =
            CommonExtras::parse(&extra, &["min_score", "fast_candidates"])
                .unwrap();
        assert_eq!(parsed.min_score, Some(0.25));
        assert_eq!(parsed.fast_candidates, Some(128));
    }

    #[test]
    fn extras_reject_unknown_and_malformed() {
        let unknown = BTreeMap::from([("ncells".to_string(), json!(4))]);
        let err = CommonExtras::parse(&unknown, &["min_score"]).unwrap_err();
        assert!(err.to_string().contains("ncells"));

        let zero = BTreeMap::from([("fast_candidates".to_string(), json!(0))]);
        assert!(matches!(
            CommonExtras::parse(&zero, &["fast_candidates"]),
            Err(Error::Config(_))
        ));

        let not_allowed =
            BTreeMap::from([("fast_candidates".to_string(), json!(8))]);
        assert!(CommonExtras::parse(&not_allowed, &["min_score"]).is_err());
    }
}
