//! Turning raw collections into documents and indexable passages.

use std::{collections::HashSet, path::Path};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    chunking::{ChunkingConfig, ChunkingStrategy},
    error::{Error, Result},
    walker,
};

/// A source document with a stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }
}

/// The unit handed to a retrieval model: one chunk of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    /// Id of the document this passage was cut from.
    pub document_id: String,
    /// Position of that document within its index.
    pub document_ordinal: usize,
    /// Chunk ordinal within the document.
    pub chunk_index: usize,
    pub content: String,
}

/// How passages are cut out of documents.
#[derive(Debug, Clone, Copy)]
pub struct Chunking<'a> {
    pub strategy: &'a dyn ChunkingStrategy,
    pub config: ChunkingConfig,
}

/// Pair each text of `collection` with an id.
///
/// Without explicit ids a document is identified by its ordinal, counting
/// from `first_ordinal`. Explicit ids must match the collection length, be
/// non-empty and be unique.
///
/// # Examples
///
/// ```
/// use magnet::corpus::prepare_documents;
///
/// let docs = prepare_documents(vec!["a".into(), "b".into()], None, 3).unwrap();
/// assert_eq!(docs[0].id, "3");
/// assert_eq!(docs[1].id, "4");
/// ```
pub fn prepare_documents(
    collection: Vec<String>,
    ids: Option<Vec<String>>,
    first_ordinal: usize,
) -> Result<Vec<Document>> {
    let documents: Vec<Document> = match ids {
        Some(ids) => {
            if ids.len() != collection.len() {
                return Err(Error::Config(format!(
                    "got {} document ids for {} documents",
                    ids.len(),
                    collection.len()
                )));
            }
            ids.into_iter()
                .zip(collection)
                .map(|(id, content)| Document { id, content })
                .collect()
        }
        None => collection
            .into_iter()
            .enumerate()
            .map(|(i, content)| Document {
                id: (first_ordinal + i).to_string(),
                content,
            })
            .collect(),
    };

    check_document_ids(&documents)?;
    Ok(documents)
}

/// Reject empty or repeated document ids.
pub fn check_document_ids(documents: &[Document]) -> Result<()> {
    let mut seen = HashSet::with_capacity(documents.len());
    for doc in documents {
        if doc.id.is_empty() {
            return Err(Error::Config("document ids must not be empty".into()));
        }
        if !seen.insert(doc.id.as_str()) {
            return Err(Error::Config(format!(
                "duplicate document id '{}'",
                doc.id
            )));
        }
    }
    Ok(())
}

/// Cut documents into passages, in document order.
///
/// Without `chunking` every document becomes exactly one passage. Ordinals
/// start at `first_ordinal`.
pub fn split_into_passages(
    documents: &[Document],
    first_ordinal: usize,
    chunking: Option<Chunking<'_>>,
) -> Vec<Passage> {
    let passages: Vec<Passage> = documents
        .iter()
        .enumerate()
        .flat_map(|(i, doc)| {
            let texts: Vec<String> = match chunking {
                Some(Chunking { strategy, config }) => strategy
                    .split(&doc.content, &config)
                    .into_iter()
                    .map(|chunk| chunk.text)
                    .collect(),
                None => vec![doc.content.clone()],
            };

            texts
                .into_iter()
                .enumerate()
                .map(move |(chunk_index, content)| Passage {
                    document_id: doc.id.clone(),
                    document_ordinal: first_ordinal + i,
                    chunk_index,
                    content,
                })
        })
        .collect();

    debug!(
        documents = documents.len(),
        passages = passages.len(),
        strategy = chunking.map(|c| c.strategy.name()),
        "split documents into passages"
    );

    passages
}

/// Number of distinct documents referenced by `passages`.
pub fn count_documents(passages: &[Passage]) -> usize {
    passages
        .iter()
        .map(|p| p.document_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

/// Load every `.md` and `.txt` file under `root` as a document whose id is
/// its relative path.
///
/// Files are read in parallel. Files that are not valid UTF-8 are skipped
/// with a warning.
pub fn load_directory(root: &Path) -> Result<Vec<Document>> {
    let files = walker::discover_files(root)?;

    let documents: Vec<Document> = files
        .par_iter()
        .filter_map(|file| {
            match std::fs::read_to_string(&file.absolute_path) {
                Ok(content) => Some(Document::new(file.document_id(), content)),
                Err(e) => {
                    warn!(
                        path = %file.absolute_path.display(),
                        error = %e,
                        "skipping unreadable file"
                    );
                    None
                }
            }
        })
        .collect();

    debug!(root = %root.display(), documents = documents.len(), "loaded corpus");
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::FixedWidthSplitter;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_ids_are_ordinals() {
        let docs = prepare_documents(texts(&["x", "y", "z"]), None, 0).unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[test]
    fn explicit_ids_are_kept() {
        let docs = prepare_documents(
            texts(&["x", "y"]),
            Some(texts(&["intro", "usage"])),
            0,
        )
        .unwrap();
        assert_eq!(docs[1], Document::new("usage", "y"));
    }

    #[test]
    fn id_count_mismatch_is_config_error() {
        let err = prepare_documents(texts(&["x", "y"]), Some(texts(&["a"])), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn duplicate_ids_are_config_error() {
        let err = prepare_documents(
            texts(&["x", "y"]),
            Some(texts(&["same", "same"])),
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate document id 'same'"));
    }

    #[test]
    fn empty_id_is_config_error() {
        let err =
            prepare_documents(texts(&["x"]), Some(texts(&[""])), 0).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unsplit_documents_become_single_passages() {
        let docs = prepare_documents(texts(&["first", "second"]), None, 0)
            .unwrap();
        let passages = split_into_passages(&docs, 0, None);

        assert_eq!(passages.len(), 2);
        assert_eq!(passages[1].content, "second");
        assert_eq!(passages[1].document_ordinal, 1);
        assert_eq!(passages[1].chunk_index, 0);
    }

    #[test]
    fn chunked_passages_keep_provenance() {
        let docs = vec![
            Document::new("a", "abcdefgh"),
            Document::new("b", "xy"),
        ];
        let chunking = Chunking {
            strategy: &FixedWidthSplitter,
            config: ChunkingConfig::new(4, 0).unwrap(),
        };
        let passages = split_into_passages(&docs, 10, Some(chunking));

        let summary: Vec<_> = passages
            .iter()
            .map(|p| {
                (
                    p.document_id.as_str(),
                    p.document_ordinal,
                    p.chunk_index,
                    p.content.as_str(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a", 10, 0, "abcd"),
                ("a", 10, 1, "efgh"),
                ("b", 11, 0, "xy"),
            ]
        );
        assert_eq!(count_documents(&passages), 2);
    }

    #[test]
    fn load_directory_uses_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("notes")).unwrap();
        std::fs::write(tmp.path().join("notes/rust.md"), "# Rust").unwrap();
        std::fs::write(tmp.path().join("todo.txt"), "ship it").unwrap();
        std::fs::write(tmp.path().join("data.json"), "{}").unwrap();
        std::fs::write(tmp.path().join("bad.txt"), [0xff, 0xfe, 0x00]).unwrap();

        let docs = load_directory(tmp.path()).unwrap();
        assert_eq!(
            docs,
            vec![
                Document::new("notes/rust.md", "# Rust"),
                Document::new("todo.txt", "ship it"),
            ]
        );
    }
}
