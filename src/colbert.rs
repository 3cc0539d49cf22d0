//! The ColBERT retrieval model.
//!
//! Each index lives in its own directory under the data root:
//!
//! ```text
//! <data root>/colbert/indexes/<name>/
//!     metadata.json     written last; its presence marks a complete index
//!     embeddings.redb   token embeddings and passage records
//!     lexical/          tantivy BM25 index of passage text
//! ```
//!
//! Builds and additions are written to `.staging-<name>` and then swapped
//! in, so a reader opening the index sees either the old or the new version.
//! Searching ranks passages by MaxSim over the token embeddings. With
//! `force_fast`, only the best lexical candidates are ranked.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    corpus::{Passage, count_documents},
    data_dir::{DataDir, validate_index_name},
    embedding::{embed_and_store, matrix_to_tensor},
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    model_manager::{ModelManager, model_from_env, resolve_checkpoint},
    reranker,
    retrieval::{
        CommonExtras,
        IndexRef,
        ModelConfig,
        RetrievalModel,
        ScoredPassage,
        SearchOptions,
        finalize_ranking,
    },
    tantivy_index::LexicalIndex,
};

pub const METADATA_FILE: &str = "metadata.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.redb";
pub const LEXICAL_DIR: &str = "lexical";

const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";
const LOCK_PREFIX: &str = ".lock-";

/// Lexical candidates ranked per requested result on the fast path.
const FAST_CANDIDATES_PER_RESULT: usize = 8;
const MIN_FAST_CANDIDATES: usize = 64;

const SEARCH_OPTIONS: &[&str] = &["min_score", "fast_candidates"];

/// Persisted description of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub model_id: String,
    pub doc_maxlen: usize,
    pub num_passages: usize,
    pub num_documents: usize,
    /// Id the next added passage receives.
    pub next_passage_id: u64,
    pub created_with: String,
}

impl IndexMetadata {
    pub fn read(index_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(index_dir.join(METADATA_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write(&self, index_dir: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(index_dir.join(METADATA_FILE), raw)?;
        Ok(())
    }
}

/// An index held in memory for searching.
struct LoadedIndex {
    info: IndexRef,
    model_id: String,
    passages: Vec<(u64, Passage)>,
    embeddings: Vec<Tensor>,
    positions: HashMap<u64, usize>,
    lexical: LexicalIndex,
}

impl LoadedIndex {
    fn load(dir: &Path, name: &str) -> Result<Self> {
        let metadata = IndexMetadata::read(dir)?;

        let stored = EmbeddingDb::open(&dir.join(EMBEDDINGS_FILE))?.load_all()?;
        let embeddings = stored
            .iter()
            .map(|s| matrix_to_tensor(&s.embedding))
            .collect::<Result<Vec<_>>>()?;
        let passages: Vec<(u64, Passage)> = stored
            .into_iter()
            .map(|s| (s.passage_id, s.passage))
            .collect();
        let positions = passages
            .iter()
            .enumerate()
            .map(|(pos, (id, _))| (*id, pos))
            .collect();

        let lexical = LexicalIndex::open(&dir.join(LEXICAL_DIR))?;

        debug!(index = name, passages = passages.len(), "loaded index");
        Ok(Self {
            info: IndexRef {
                name: name.to_string(),
                path: dir.to_path_buf(),
                doc_maxlen: metadata.doc_maxlen,
                num_passages: passages.len(),
                num_documents: metadata.num_documents,
            },
            model_id: metadata.model_id,
            passages,
            embeddings,
            positions,
            lexical,
        })
    }

    /// Rank passages for one query.
    fn rank(
        &self,
        query: &str,
        query_embedding: &Tensor,
        k: usize,
        force_fast: bool,
        extras: &CommonExtras,
    ) -> Result<Vec<ScoredPassage>> {
        let mut candidates: Vec<usize> = Vec::new();
        if force_fast {
            let limit = extras.fast_candidates.unwrap_or(
                (k * FAST_CANDIDATES_PER_RESULT).max(MIN_FAST_CANDIDATES),
            );
            candidates = self
                .lexical
                .search(query, limit)?
                .iter()
                .filter_map(|hit| self.positions.get(&hit.passage_id).copied())
                .collect();
            if candidates.len() < k {
                debug!(
                    candidates = candidates.len(),
                    k, "too few lexical candidates, ranking all passages"
                );
                candidates.clear();
            }
        }
        if candidates.is_empty() {
            candidates = (0..self.passages.len()).collect();
        }

        let scored: Vec<(u64, &Tensor)> = candidates
            .iter()
            .map(|&pos| (self.passages[pos].0, &self.embeddings[pos]))
            .collect();
        let ranked = reranker::rerank(query_embedding, &scored)?;

        let hits = ranked
            .into_iter()
            .filter_map(|r| {
                let pos = *self.positions.get(&r.passage_id)?;
                let passage = &self.passages[pos].1;
                Some(ScoredPassage {
                    passage_id: r.passage_id,
                    document_id: passage.document_id.clone(),
                    content: passage.content.clone(),
                    score: r.score,
                    rank: 0,
                })
            })
            .collect();

        Ok(finalize_ranking(hits, k, extras.min_score))
    }
}

/// ColBERT late-interaction model with persisted, named indexes.
pub struct ColbertModel {
    encoder: ModelManager,
    config: ModelConfig,
    indexes_root: PathBuf,
    bound: Option<LoadedIndex>,
}

impl std::fmt::Debug for ColbertModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColbertModel")
            .field("config", &self.config)
            .field("indexes_root", &self.indexes_root)
            .field("bound", &self.bound.as_ref().map(|b| &b.info.name))
            .finish_non_exhaustive()
    }
}

impl ColbertModel {
    /// Bind to the checkpoint named by `MAGNET_MODEL`, or the default one.
    pub fn load_default() -> Result<Self> {
        Self::load_pretrained(&model_from_env())
    }

    pub fn load_default_in(data_dir: &DataDir) -> Result<Self> {
        Self::load_pretrained_in(&model_from_env(), data_dir)
    }

    /// Bind to a checkpoint, storing indexes under the resolved data
    /// directory. No index is attached and no weights are loaded yet.
    pub fn load_pretrained(model_ref: &str) -> Result<Self> {
        Self::load_pretrained_in(model_ref, &DataDir::resolve(None)?)
    }

    pub fn load_pretrained_in(
        model_ref: &str,
        data_dir: &DataDir,
    ) -> Result<Self> {
        let config = resolve_checkpoint(model_ref)?;
        info!(
            model = %config.model_id,
            root = %data_dir.root().display(),
            "bound checkpoint"
        );
        Ok(Self {
            encoder: ModelManager::with_model_id(config.model_id.clone()),
            config,
            indexes_root: data_dir.indexes_dir(),
            bound: None,
        })
    }

    /// Bind to the index stored at `index_path` and the checkpoint it was
    /// built with.
    pub fn load_from_index(index_path: &Path) -> Result<Self> {
        let name = index_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let not_found = || Error::IndexNotFound {
            name: name.clone(),
            path: index_path.to_path_buf(),
        };

        if !index_path.is_dir() {
            return Err(not_found());
        }
        let metadata = IndexMetadata::read(index_path).map_err(|e| {
            debug!(
                path = %index_path.display(),
                error = %e,
                "unreadable index metadata"
            );
            not_found()
        })?;
        let indexes_root =
            index_path.parent().ok_or_else(not_found)?.to_path_buf();

        let loaded = LoadedIndex::load(index_path, &name)?;
        info!(index = %name, model = %metadata.model_id, "loaded index");

        Ok(Self {
            encoder: ModelManager::with_model_id(metadata.model_id.clone()),
            config: ModelConfig {
                model_id: metadata.model_id,
                doc_maxlen: metadata.doc_maxlen,
            },
            indexes_root,
            bound: Some(loaded),
        })
    }

    fn not_found(&self, name: &str) -> Error {
        Error::IndexNotFound {
            name: name.to_string(),
            path: self.index_path(name),
        }
    }

    fn bind(&mut self, loaded: LoadedIndex) -> IndexRef {
        if loaded.model_id != self.config.model_id {
            warn!(
                index = %loaded.info.name,
                index_model = %loaded.model_id,
                model = %self.config.model_id,
                "index was built with a different checkpoint"
            );
        }
        let info = loaded.info.clone();
        self.config.doc_maxlen = info.doc_maxlen;
        self.bound = Some(loaded);
        info
    }

    fn staging_dir(&self, name: &str) -> PathBuf {
        self.indexes_root.join(format!("{STAGING_PREFIX}{name}"))
    }

    /// Encode `passages` into the index directory `dir` and add them to its
    /// lexical index.
    fn write_passages(
        &mut self,
        dir: &Path,
        passages: &[(u64, Passage)],
    ) -> Result<()> {
        {
            let db = EmbeddingDb::open(&dir.join(EMBEDDINGS_FILE))?;
            embed_and_store(&mut self.encoder, &db, passages)?;
        }

        let lexical = LexicalIndex::open(&dir.join(LEXICAL_DIR))?;
        lexical.add_passages(
            passages.iter().map(|(id, p)| (*id, p.content.as_str())),
        )?;
        Ok(())
    }

    /// Run `stage` against a fresh staging directory, then swap it in as the
    /// index `name`. The staging directory is removed on failure.
    fn stage_and_swap<F>(
        &mut self,
        name: &str,
        seed: Option<&Path>,
        stage: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Self, &Path) -> Result<()>,
    {
        let staging = self.staging_dir(name);
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        match seed {
            Some(source) => copy_dir(source, &staging)?,
            None => std::fs::create_dir_all(&staging)?,
        }

        if let Err(e) = stage(self, &staging) {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(
                    path = %staging.display(),
                    error = %cleanup,
                    "could not remove staging directory"
                );
            }
            return Err(match e {
                e @ (Error::ModelLoad { .. } | Error::Config(_)) => e,
                other => Error::build(name, other.to_string()),
            });
        }

        let target = self.index_path(name);
        swap_into_place(&staging, &target, &self.indexes_root, name)
    }
}

/// Replace `target` with `staging`, keeping the old version until the new
/// one is in place.
fn swap_into_place(
    staging: &Path,
    target: &Path,
    root: &Path,
    name: &str,
) -> Result<()> {
    if target.exists() {
        let retired = root.join(format!("{RETIRED_PREFIX}{name}"));
        if retired.exists() {
            std::fs::remove_dir_all(&retired)?;
        }
        std::fs::rename(target, &retired)?;
        std::fs::rename(staging, target)?;
        if let Err(e) = std::fs::remove_dir_all(&retired) {
            warn!(
                path = %retired.display(),
                error = %e,
                "could not remove retired index"
            );
        }
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(staging, target)?;
    }
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

impl RetrievalModel for ColbertModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn bound_index(&self) -> Option<&IndexRef> {
        self.bound.as_ref().map(|b| &b.info)
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.indexes_root.join(name)
    }

    fn lock_file(&self, name: &str) -> Option<PathBuf> {
        Some(self.indexes_root.join(format!("{LOCK_PREFIX}{name}")))
    }

    fn index_exists(&self, name: &str) -> bool {
        validate_index_name(name).is_ok()
            && self.index_path(name).join(METADATA_FILE).is_file()
    }

    fn open_index(&mut self, name: &str) -> Result<IndexRef> {
        validate_index_name(name)?;
        if !self.index_exists(name) {
            return Err(self.not_found(name));
        }
        let loaded = LoadedIndex::load(&self.index_path(name), name)?;
        Ok(self.bind(loaded))
    }

    fn index(
        &mut self,
        passages: &[Passage],
        name: &str,
        max_document_length: usize,
        overwrite: bool,
    ) -> Result<IndexRef> {
        validate_index_name(name)?;
        let exists = self.index_exists(name);
        if exists && !overwrite {
            return Err(Error::IndexExists {
                name: name.to_string(),
            });
        }
        if passages.is_empty() {
            return Err(Error::build(name, "no passages to index"));
        }
        if exists {
            warn!(index = name, "replacing existing index");
        }

        let keyed: Vec<(u64, Passage)> = passages
            .iter()
            .enumerate()
            .map(|(id, p)| (id as u64, p.clone()))
            .collect();
        let metadata = IndexMetadata {
            name: name.to_string(),
            model_id: self.config.model_id.clone(),
            doc_maxlen: max_document_length,
            num_passages: keyed.len(),
            num_documents: count_documents(passages),
            next_passage_id: keyed.len() as u64,
            created_with: concat!("magnet ", env!("CARGO_PKG_VERSION"))
                .to_string(),
        };

        info!(index = name, passages = keyed.len(), "building index");
        self.stage_and_swap(name, None, |model, dir| {
            model.write_passages(dir, &keyed)?;
            metadata.write(dir)
        })?;

        let loaded = LoadedIndex::load(&self.index_path(name), name)?;
        Ok(self.bind(loaded))
    }

    fn add_to_index(&mut self, passages: &[Passage], name: &str) -> Result<()> {
        validate_index_name(name)?;
        let target = self.index_path(name);
        let mut metadata =
            IndexMetadata::read(&target).map_err(|_| self.not_found(name))?;
        if passages.is_empty() {
            return Err(Error::build(name, "no passages to add"));
        }

        let first_id = metadata.next_passage_id;
        let keyed: Vec<(u64, Passage)> = passages
            .iter()
            .enumerate()
            .map(|(i, p)| (first_id + i as u64, p.clone()))
            .collect();
        metadata.num_passages += keyed.len();
        metadata.num_documents += count_documents(passages);
        metadata.next_passage_id = first_id + keyed.len() as u64;

        info!(index = name, passages = keyed.len(), "adding to index");
        self.stage_and_swap(name, Some(&target), |model, dir| {
            model.write_passages(dir, &keyed)?;
            metadata.write(dir)
        })?;

        if self.bound.as_ref().is_some_and(|b| b.info.name == name) {
            let loaded = LoadedIndex::load(&target, name)?;
            self.bind(loaded);
        }
        Ok(())
    }

    fn search(
        &mut self,
        queries: &[String],
        name: &str,
        options: &SearchOptions,
    ) -> Result<Vec<Vec<ScoredPassage>>> {
        if options.k == 0 {
            return Err(Error::Config("k must be greater than zero".into()));
        }
        let extras = CommonExtras::parse(&options.extra, SEARCH_OPTIONS)?;
        validate_index_name(name)?;
        if !self.index_exists(name) {
            return Err(self.not_found(name));
        }

        let other;
        let index = match &self.bound {
            Some(bound) if bound.info.name == name => bound,
            _ => {
                other = LoadedIndex::load(&self.index_path(name), name)?;
                &other
            }
        };

        let query_embeddings = self.encoder.encode_queries(queries)?;
        queries
            .iter()
            .zip(&query_embeddings)
            .map(|(query, embedding)| {
                index.rank(
                    query,
                    embedding,
                    options.k,
                    options.force_fast,
                    &extras,
                )
            })
            .collect()
    }
}
