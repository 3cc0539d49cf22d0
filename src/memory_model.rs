//! A retrieval model that keeps its indexes in RAM.
//!
//! Passages are ranked by BM25 over an in-memory tantivy index, so results
//! are deterministic and need no model download. Clones share their indexes,
//! and every call is recorded, which makes this model the natural test double
//! for [`NeuralSearch`](crate::NeuralSearch).

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    chunking::DEFAULT_MAX_DOCUMENT_LENGTH,
    corpus::{Passage, count_documents},
    error::{Error, Result},
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

static NEXT_STORE_ID: AtomicUsize = AtomicUsize::new(0);

/// A call received by an [`InMemoryModel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelCall {
    Open {
        name: String,
    },
    Build {
        name: String,
        passages: usize,
        max_document_length: usize,
        overwrite: bool,
    },
    Add {
        name: String,
        passages: usize,
    },
    Search {
        name: String,
        queries: usize,
        k: usize,
        force_fast: bool,
    },
}

/// Wall-clock extent of one build or add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSpan {
    pub name: String,
    pub started: Instant,
    pub finished: Instant,
}

impl WriteSpan {
    pub fn overlaps(&self, other: &WriteSpan) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

struct MemoryIndex {
    info: IndexRef,
    passages: Vec<Passage>,
    lexical: LexicalIndex,
}

struct Store {
    root: PathBuf,
    indexes: HashMap<String, MemoryIndex>,
    calls: Vec<ModelCall>,
    spans: Vec<WriteSpan>,
    rejection: Option<String>,
}

/// BM25-ranked, non-persistent [`RetrievalModel`].
#[derive(Clone)]
pub struct InMemoryModel {
    config: ModelConfig,
    bound: Option<IndexRef>,
    store: Arc<Mutex<Store>>,
    write_delay: Duration,
}

impl Default for InMemoryModel {
    fn default() -> Self {
        Self::new("in-memory", DEFAULT_MAX_DOCUMENT_LENGTH)
    }
}

impl std::fmt::Debug for InMemoryModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryModel")
            .field("config", &self.config)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

impl InMemoryModel {
    pub fn new(model_id: impl Into<String>, doc_maxlen: usize) -> Self {
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            config: ModelConfig {
                model_id: model_id.into(),
                doc_maxlen,
            },
            bound: None,
            store: Arc::new(Mutex::new(Store {
                root: PathBuf::from("in-memory").join(id.to_string()),
                indexes: HashMap::new(),
                calls: Vec::new(),
                spans: Vec::new(),
                rejection: None,
            })),
            write_delay: Duration::ZERO,
        }
    }

    /// Make every build and add take at least `delay`.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Reject every following build with `reason`, for all clones.
    pub fn reject_builds(&self, reason: impl Into<String>) {
        self.store().rejection = Some(reason.into());
    }

    /// Every call received so far, across clones, in arrival order.
    pub fn calls(&self) -> Vec<ModelCall> {
        self.store().calls.clone()
    }

    /// Number of builds of `name`.
    pub fn build_count(&self, name: &str) -> usize {
        self.store()
            .calls
            .iter()
            .filter(|call| {
                matches!(call, ModelCall::Build { name: n, .. } if n == name)
            })
            .count()
    }

    /// Extents of every completed build and add.
    pub fn write_spans(&self) -> Vec<WriteSpan> {
        self.store().spans.clone()
    }

    /// The passages currently held by `name`, in passage id order.
    pub fn passages(&self, name: &str) -> Option<Vec<Passage>> {
        self.store()
            .indexes
            .get(name)
            .map(|index| index.passages.clone())
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(&mut self, info: IndexRef) -> IndexRef {
        self.config.doc_maxlen = info.doc_maxlen;
        self.bound = Some(info.clone());
        info
    }

    fn not_found(&self, name: &str) -> Error {
        Error::IndexNotFound {
            name: name.to_string(),
            path: self.index_path(name),
        }
    }
}

impl RetrievalModel for InMemoryModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn bound_index(&self) -> Option<&IndexRef> {
        self.bound.as_ref()
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.store().root.join(name)
    }

    fn index_exists(&self, name: &str) -> bool {
        self.store().indexes.contains_key(name)
    }

    fn open_index(&mut self, name: &str) -> Result<IndexRef> {
        let info = {
            let mut store = self.store();
            store.calls.push(ModelCall::Open {
                name: name.to_string(),
            });
            store.indexes.get(name).map(|index| index.info.clone())
        };
        let info = info.ok_or_else(|| self.not_found(name))?;
        Ok(self.bind(info))
    }

    fn index(
        &mut self,
        passages: &[Passage],
        name: &str,
        max_document_length: usize,
        overwrite: bool,
    ) -> Result<IndexRef> {
        let started = Instant::now();
        {
            let mut store = self.store();
            store.calls.push(ModelCall::Build {
                name: name.to_string(),
                passages: passages.len(),
                max_document_length,
                overwrite,
            });
            if let Some(reason) = &store.rejection {
                return Err(Error::build(name, reason.clone()));
            }
            if !overwrite && store.indexes.contains_key(name) {
                return Err(Error::IndexExists {
                    name: name.to_string(),
                });
            }
        }
        if passages.is_empty() {
            return Err(Error::build(name, "no passages to index"));
        }

        std::thread::sleep(self.write_delay);

        let lexical = LexicalIndex::open_in_ram()?;
        lexical.add_passages(
            passages
                .iter()
                .enumerate()
                .map(|(id, p)| (id as u64, p.content.as_str())),
        )?;

        let info = IndexRef {
            name: name.to_string(),
            path: self.index_path(name),
            doc_maxlen: max_document_length,
            num_passages: passages.len(),
            num_documents: count_documents(passages),
        };

        {
            let mut store = self.store();
            store.indexes.insert(
                name.to_string(),
                MemoryIndex {
                    info: info.clone(),
                    passages: passages.to_vec(),
                    lexical,
                },
            );
            store.spans.push(WriteSpan {
                name: name.to_string(),
                started,
                finished: Instant::now(),
            });
        }

        debug!(index = name, passages = passages.len(), "built in-memory index");
        Ok(self.bind(info))
    }

    fn add_to_index(&mut self, passages: &[Passage], name: &str) -> Result<()> {
        let started = Instant::now();
        {
            let mut store = self.store();
            store.calls.push(ModelCall::Add {
                name: name.to_string(),
                passages: passages.len(),
            });
            if !store.indexes.contains_key(name) {
                drop(store);
                return Err(self.not_found(name));
            }
        }
        if passages.is_empty() {
            return Err(Error::build(name, "no passages to add"));
        }

        std::thread::sleep(self.write_delay);

        let info = {
            let mut store = self.store();
            let Some(index) = store.indexes.get_mut(name) else {
                drop(store);
                return Err(self.not_found(name));
            };

            let first_id = index.passages.len() as u64;
            index.lexical.add_passages(
                passages
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (first_id + i as u64, p.content.as_str())),
            )?;
            index.passages.extend_from_slice(passages);
            index.info.num_passages = index.passages.len();
            index.info.num_documents += count_documents(passages);
            let info = index.info.clone();

            store.spans.push(WriteSpan {
                name: name.to_string(),
                started,
                finished: Instant::now(),
            });
            info
        };

        if self.bound.as_ref().is_some_and(|b| b.name == name) {
            self.bind(info);
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
        let extras = CommonExtras::parse(&options.extra, &["min_score"])?;

        let mut store = self.store();
        store.calls.push(ModelCall::Search {
            name: name.to_string(),
            queries: queries.len(),
            k: options.k,
            force_fast: options.force_fast,
        });
        let Some(index) = store.indexes.get(name) else {
            drop(store);
            return Err(self.not_found(name));
        };

        queries
            .iter()
            .map(|query| -> Result<Vec<ScoredPassage>> {
                let hits = index
                    .lexical
                    .search(query, index.passages.len().max(1))?
                    .into_iter()
                    .filter_map(|hit| {
                        let passage = index.passages.get(hit.passage_id as usize)?;
                        Some(ScoredPassage {
                            passage_id: hit.passage_id,
                            document_id: passage.document_id.clone(),
                            content: passage.content.clone(),
                            score: hit.score,
                            rank: 0,
                        })
                    })
                    .collect();
                Ok(finalize_ranking(hits, options.k, extras.min_score))
            })
            .collect()
    }
}
