use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::retrieval::ScoredPassage;

/// One query or a batch of queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Query {
    Single(String),
    Batch(Vec<String>),
}

impl Query {
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    /// The query texts in order.
    pub fn texts(&self) -> Vec<String> {
        match self {
            Self::Single(text) => vec![text.clone()],
            Self::Batch(texts) => texts.clone(),
        }
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Self::Single(text.to_string())
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Self::Single(text)
    }
}

impl From<Vec<String>> for Query {
    fn from(texts: Vec<String>) -> Self {
        Self::Batch(texts)
    }
}

impl From<Vec<&str>> for Query {
    fn from(texts: Vec<&str>) -> Self {
        Self::Batch(texts.into_iter().map(str::to_string).collect())
    }
}

/// A search against a named index.
///
/// # Examples
///
/// ```
/// use magnet::search::{Query, SearchRequest};
///
/// let request = SearchRequest::new("borrow checker")
///     .index("rust_book")
///     .k(5)
///     .zero_index_ranks(true);
/// assert_eq!(request.query, Query::Single("borrow checker".into()));
/// assert_eq!(request.k, 5);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: Query,
    /// Target index. Defaults to the bound index.
    pub index_name: Option<String>,
    pub k: usize,
    pub force_fast: bool,
    /// Present ranks starting at 0 instead of 1.
    pub zero_index_ranks: bool,
    /// Model-specific options, forwarded as-is.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SearchRequest {
    pub fn new(query: impl Into<Query>) -> Self {
        Self {
            query: query.into(),
            index_name: None,
            k: 10,
            force_fast: false,
            zero_index_ranks: false,
            extra: BTreeMap::new(),
        }
    }

    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index_name = Some(name.into());
        self
    }

    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn force_fast(mut self, force_fast: bool) -> Self {
        self.force_fast = force_fast;
        self
    }

    pub fn zero_index_ranks(mut self, zero_index_ranks: bool) -> Self {
        self.zero_index_ranks = zero_index_ranks;
        self
    }

    pub fn option(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A ranked passage as presented to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    pub score: f32,
    pub rank: usize,
    pub document_id: String,
    pub passage_id: u64,
}

/// Results shaped like the query: a flat list for a single query, one list
/// per query for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchResults {
    Single(Vec<SearchResult>),
    Batch(Vec<Vec<SearchResult>>),
}

impl SearchResults {
    /// Results of a single query, `None` for a batch.
    pub fn single(&self) -> Option<&[SearchResult]> {
        match self {
            Self::Single(results) => Some(results),
            Self::Batch(_) => None,
        }
    }

    /// One result list per query.
    pub fn into_batch(self) -> Vec<Vec<SearchResult>> {
        match self {
            Self::Single(results) => vec![results],
            Self::Batch(batch) => batch,
        }
    }
}

/// Convert model hits into caller-facing results. Order and scores are kept;
/// only the rank numbering changes.
pub(crate) fn present(
    hits: Vec<ScoredPassage>,
    zero_index_ranks: bool,
) -> Vec<SearchResult> {
    hits.into_iter()
        .map(|hit| SearchResult {
            rank: if zero_index_ranks {
                hit.rank.saturating_sub(1)
            } else {
                hit.rank
            },
            content: hit.content,
            score: hit.score,
            document_id: hit.document_id,
            passage_id: hit.passage_id,
        })
        .collect()
}

/// Shape per-query hits like `query`.
pub(crate) fn assemble(
    query: &Query,
    per_query: Vec<Vec<ScoredPassage>>,
    zero_index_ranks: bool,
) -> SearchResults {
    let mut presented = per_query
        .into_iter()
        .map(|hits| present(hits, zero_index_ranks));

    match query {
        Query::Single(_) => {
            SearchResults::Single(presented.next().unwrap_or_default())
        }
        Query::Batch(_) => SearchResults::Batch(presented.collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(passage_id: u64, score: f32, rank: usize) -> ScoredPassage {
        ScoredPassage {
            passage_id,
            document_id: format!("doc-{passage_id}"),
            content: format!("passage {passage_id}"),
            score,
            rank,
        }
    }

    #[test]
    fn query_conversions() {
        assert_eq!(Query::from("a"), Query::Single("a".into()));
        assert_eq!(
            Query::from(vec!["a", "b"]),
            Query::Batch(vec!["a".into(), "b".into()])
        );
        assert!(Query::from(Vec::<String>::new()).is_batch());
        assert_eq!(Query::from("a").texts(), vec!["a"]);
    }

    #[test]
    fn request_defaults() {
        let request = SearchRequest::new("q");
        assert_eq!(request.k, 10);
        assert!(request.index_name.is_none());
        assert!(!request.force_fast);
        assert!(!request.zero_index_ranks);
        assert!(request.extra.is_empty());

        let request = request.option("min_score", 0.5);
        assert_eq!(request.extra["min_score"], serde_json::json!(0.5));
    }

    #[test]
    fn zero_index_ranks_shift_only_ranks() {
        let hits = vec![hit(4, 0.9, 1), hit(2, 0.5, 2), hit(7, 0.1, 3)];

        let one_based = present(hits.clone(), false);
        let zero_based = present(hits, true);

        let ranks: Vec<_> = zero_based.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        for (a, b) in one_based.iter().zip(&zero_based) {
            assert_eq!(a.passage_id, b.passage_id);
            assert_eq!(a.score, b.score);
            assert_eq!(a.rank, b.rank + 1);
        }
    }

    #[test]
    fn results_follow_query_shape() {
        let single = assemble(&Query::from("q"), vec![vec![hit(1, 1.0, 1)]], false);
        assert_eq!(single.single().unwrap().len(), 1);

        let batch = assemble(
            &Query::from(vec!["a", "b"]),
            vec![vec![hit(1, 1.0, 1)], vec![]],
            false,
        );
        assert!(batch.single().is_none());
        let lists = batch.into_batch();
        assert_eq!(lists.len(), 2);
        assert!(lists[1].is_empty());
    }

    #[test]
    fn results_serialize_untagged() {
        let results = SearchResults::Single(present(vec![hit(3, 0.5, 1)], true));
        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json[0]["rank"], 0);
        assert_eq!(json[0]["document_id"], "doc-3");
    }
}
