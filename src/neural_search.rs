//! Index lifecycle management and the search entry point.
//!
//! [`NeuralSearch`] turns raw collections into passages, decides whether an
//! index is built, reused or refused, serializes writers per index and
//! forwards queries to its [`RetrievalModel`].

use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    chunking::{
        ChunkerKind,
        ChunkingConfig,
        ChunkingStrategy,
        DEFAULT_MAX_DOCUMENT_LENGTH,
        default_strategy,
    },
    colbert::ColbertModel,
    corpus::{self, Chunking, Document},
    data_dir::{DataDir, validate_index_name},
    error::{Error, Result},
    index_lock::{IndexWriteGuard, lock_index},
    retrieval::{IndexRef, RetrievalModel, SearchOptions},
    search::{self, Query, SearchRequest, SearchResults},
};

/// What to do when the target index already exists.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Destroy the existing index and build a new one.
    #[default]
    ForceOverwrite,
    /// Attach to the existing index unchanged; build only if it is missing.
    Reuse,
    /// Refuse with [`Error::IndexExists`].
    FailIfExists,
}

impl From<bool> for OverwritePolicy {
    fn from(overwrite: bool) -> Self {
        if overwrite {
            Self::ForceOverwrite
        } else {
            Self::Reuse
        }
    }
}

/// Options for building an index.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Defaults to `<model basename>_new_index`.
    pub index_name: Option<String>,
    pub overwrite: OverwritePolicy,
    /// Chunk size when splitting, and the index's document length.
    pub max_document_length: usize,
    pub split_documents: bool,
    pub chunker: Arc<dyn ChunkingStrategy>,
    /// Ids for the collection's documents, in order.
    pub document_ids: Option<Vec<String>>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            index_name: None,
            overwrite: OverwritePolicy::default(),
            max_document_length: DEFAULT_MAX_DOCUMENT_LENGTH,
            split_documents: true,
            chunker: default_strategy(),
            document_ids: None,
        }
    }
}

impl IndexOptions {
    /// Default options targeting `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            index_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn overwrite(mut self, policy: impl Into<OverwritePolicy>) -> Self {
        self.overwrite = policy.into();
        self
    }

    pub fn max_document_length(mut self, length: usize) -> Self {
        self.max_document_length = length;
        self
    }

    pub fn split_documents(mut self, split: bool) -> Self {
        self.split_documents = split;
        self
    }

    pub fn chunker(mut self, kind: ChunkerKind) -> Self {
        self.chunker = kind.strategy();
        self
    }

    pub fn chunking_strategy(mut self, strategy: Arc<dyn ChunkingStrategy>) -> Self {
        self.chunker = strategy;
        self
    }

    pub fn document_ids(mut self, ids: Vec<String>) -> Self {
        self.document_ids = Some(ids);
        self
    }
}

/// Options for adding documents to an existing index.
#[derive(Debug, Clone)]
pub struct AddOptions {
    /// Defaults to the bound index.
    pub index_name: Option<String>,
    pub split_documents: bool,
    pub chunker: Arc<dyn ChunkingStrategy>,
    pub document_ids: Option<Vec<String>>,
    /// Chunk size, at most the index's document length. Defaults to it.
    pub max_document_length: Option<usize>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            index_name: None,
            split_documents: true,
            chunker: default_strategy(),
            document_ids: None,
            max_document_length: None,
        }
    }
}

impl AddOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            index_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn split_documents(mut self, split: bool) -> Self {
        self.split_documents = split;
        self
    }

    pub fn chunker(mut self, kind: ChunkerKind) -> Self {
        self.chunker = kind.strategy();
        self
    }

    pub fn document_ids(mut self, ids: Vec<String>) -> Self {
        self.document_ids = Some(ids);
        self
    }

    pub fn max_document_length(mut self, length: usize) -> Self {
        self.max_document_length = Some(length);
        self
    }
}

/// Which index, if any, a [`NeuralSearch`] is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexBinding {
    NoIndex,
    /// Built by this handle.
    Built(IndexRef),
    /// Loaded, reused or opened.
    Existing(IndexRef),
}

impl IndexBinding {
    pub fn index(&self) -> Option<&IndexRef> {
        match self {
            Self::NoIndex => None,
            Self::Built(index) | Self::Existing(index) => Some(index),
        }
    }
}

/// Neural search over named indexes of a [`RetrievalModel`].
///
/// # Examples
///
/// ```
/// use magnet::{IndexOptions, InMemoryModel, NeuralSearch, SearchRequest};
///
/// let mut search = NeuralSearch::with_model(InMemoryModel::default());
/// search
///     .index(
///         vec!["Rust has no garbage collector.".into()],
///         &IndexOptions::named("notes"),
///     )
///     .unwrap();
///
/// let results = search.search(&SearchRequest::new("garbage")).unwrap();
/// assert_eq!(results.single().unwrap()[0].document_id, "0");
/// ```
#[derive(Debug)]
pub struct NeuralSearch<M: RetrievalModel = ColbertModel> {
    model: M,
    binding: IndexBinding,
}

impl NeuralSearch<ColbertModel> {
    /// Bind to the checkpoint named by `MAGNET_MODEL`, falling back to
    /// `lightonai/GTE-ModernColBERT-v1`.
    pub fn load_default() -> Result<Self> {
        Ok(Self::with_model(ColbertModel::load_default()?))
    }

    pub fn load_default_in(data_dir: &DataDir) -> Result<Self> {
        Ok(Self::with_model(ColbertModel::load_default_in(data_dir)?))
    }

    /// Bind to a ColBERT checkpoint with no index attached.
    pub fn load_pretrained(model_ref: &str) -> Result<Self> {
        Ok(Self::with_model(ColbertModel::load_pretrained(model_ref)?))
    }

    pub fn load_pretrained_in(model_ref: &str, data_dir: &DataDir) -> Result<Self> {
        Ok(Self::with_model(ColbertModel::load_pretrained_in(
            model_ref, data_dir,
        )?))
    }

    /// Bind to an existing index and the checkpoint it was built with.
    pub fn load_from_index(index_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_model(ColbertModel::load_from_index(
            index_path.as_ref(),
        )?))
    }
}

impl<M: RetrievalModel> NeuralSearch<M> {
    pub fn with_model(model: M) -> Self {
        let binding = match model.bound_index() {
            Some(index) => IndexBinding::Existing(index.clone()),
            None => IndexBinding::NoIndex,
        };
        Self { model, binding }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn state(&self) -> &IndexBinding {
        &self.binding
    }

    pub fn bound_index(&self) -> Option<&IndexRef> {
        self.binding.index()
    }

    /// `<model basename>_new_index`.
    pub fn default_index_name(&self) -> String {
        let model_id = &self.model.config().model_id;
        let basename = model_id
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("model");
        format!("{basename}_new_index")
    }

    /// Build (or reuse) an index from raw texts.
    pub fn index(
        &mut self,
        collection: Vec<String>,
        options: &IndexOptions,
    ) -> Result<IndexRef> {
        let chunking = self.index_chunking(options)?;
        let documents = corpus::prepare_documents(
            collection,
            options.document_ids.clone(),
            0,
        )?;
        self.build(documents, options, chunking)
    }

    /// Build (or reuse) an index from documents carrying their own ids.
    pub fn index_documents(
        &mut self,
        documents: Vec<Document>,
        options: &IndexOptions,
    ) -> Result<IndexRef> {
        let chunking = self.index_chunking(options)?;
        if options.document_ids.is_some() {
            return Err(Error::Config(
                "document_ids cannot be combined with identified documents"
                    .into(),
            ));
        }
        corpus::check_document_ids(&documents)?;
        self.build(documents, options, chunking)
    }

    /// Build (or reuse) an index from the `.md` and `.txt` files under
    /// `root`, identified by relative path.
    pub fn index_directory(
        &mut self,
        root: &Path,
        options: &IndexOptions,
    ) -> Result<IndexRef> {
        let documents = corpus::load_directory(root)?;
        self.index_documents(documents, options)
    }

    fn lock(&self, name: &str) -> Result<IndexWriteGuard> {
        lock_index(
            &self.model.index_path(name),
            self.model.lock_file(name).as_deref(),
        )
    }

    fn index_chunking(
        &self,
        options: &IndexOptions,
    ) -> Result<Option<ChunkingConfig>> {
        let config =
            ChunkingConfig::for_document_length(options.max_document_length)?;
        Ok(options.split_documents.then_some(config))
    }

    fn build(
        &mut self,
        documents: Vec<Document>,
        options: &IndexOptions,
        chunking: Option<ChunkingConfig>,
    ) -> Result<IndexRef> {
        let name = match &options.index_name {
            Some(name) => name.clone(),
            None => self.default_index_name(),
        };
        validate_index_name(&name)?;

        if documents.is_empty() {
            return Err(Error::build(&name, "collection is empty"));
        }

        let _guard = self.lock(&name)?;

        if self.model.index_exists(&name) {
            match options.overwrite {
                OverwritePolicy::Reuse => {
                    let index = self.model.open_index(&name)?;
                    info!(index = %name, "reusing existing index");
                    self.binding = IndexBinding::Existing(index.clone());
                    return Ok(index);
                }
                OverwritePolicy::FailIfExists => {
                    return Err(Error::IndexExists { name });
                }
                OverwritePolicy::ForceOverwrite => {}
            }
        }

        let passages = corpus::split_into_passages(
            &documents,
            0,
            chunking.map(|config| Chunking {
                strategy: options.chunker.as_ref(),
                config,
            }),
        );

        info!(
            index = %name,
            documents = documents.len(),
            passages = passages.len(),
            "building index"
        );
        let index = self.model.index(
            &passages,
            &name,
            options.max_document_length,
            options.overwrite == OverwritePolicy::ForceOverwrite,
        )?;

        self.binding = IndexBinding::Built(index.clone());
        Ok(index)
    }

    /// Add documents to an existing index.
    ///
    /// The target is the named index, or the bound one. A named index that
    /// is not bound yet is opened first. New documents without explicit ids
    /// are numbered after the documents already in the index.
    pub fn add_to_index(
        &mut self,
        new_documents: Vec<String>,
        options: &AddOptions,
    ) -> Result<IndexRef> {
        let name = match (&options.index_name, self.bound_index()) {
            (Some(name), _) => name.clone(),
            (None, Some(bound)) => bound.name.clone(),
            (None, None) => return Err(Error::NoIndexBound),
        };
        validate_index_name(&name)?;
        if options.max_document_length == Some(0) {
            return Err(Error::Config(
                "max_document_length must be greater than zero".into(),
            ));
        }

        let _guard = self.lock(&name)?;

        if !self.model.index_exists(&name) {
            return Err(Error::IndexNotFound {
                path: self.model.index_path(&name),
                name,
            });
        }
        if new_documents.is_empty() {
            return Err(Error::build(&name, "no documents to add"));
        }

        // Another handle may have rebuilt or extended the index since it was
        // bound here, so geometry and counts always come from a fresh open.
        let current = self.model.open_index(&name)?;
        debug!(index = %name, "opened index for addition");
        let was_built = matches!(
            &self.binding,
            IndexBinding::Built(bound) if bound.name == name
        );
        self.binding = if was_built {
            IndexBinding::Built(current.clone())
        } else {
            IndexBinding::Existing(current.clone())
        };

        let doc_maxlen = current.doc_maxlen;
        let chunk_size = match options.max_document_length {
            Some(requested) if requested > doc_maxlen => {
                return Err(Error::Config(format!(
                    "max_document_length {requested} exceeds the index \
                     document length {doc_maxlen}"
                )));
            }
            Some(requested) => requested,
            None => doc_maxlen,
        };
        let chunking = ChunkingConfig::for_document_length(chunk_size)?;

        let first_ordinal = current.num_documents;
        let documents = corpus::prepare_documents(
            new_documents,
            options.document_ids.clone(),
            first_ordinal,
        )?;
        let passages = corpus::split_into_passages(
            &documents,
            first_ordinal,
            options.split_documents.then_some(Chunking {
                strategy: options.chunker.as_ref(),
                config: chunking,
            }),
        );

        info!(
            index = %name,
            documents = documents.len(),
            passages = passages.len(),
            "adding to index"
        );
        self.model.add_to_index(&passages, &name)?;

        let index = self
            .model
            .bound_index()
            .cloned()
            .ok_or(Error::NoIndexBound)?;
        self.binding = if was_built {
            IndexBinding::Built(index.clone())
        } else {
            IndexBinding::Existing(index.clone())
        };
        Ok(index)
    }

    /// Run a single or batched query.
    ///
    /// Returns at most `k` results per query in descending relevance.
    pub fn search(&mut self, request: &SearchRequest) -> Result<SearchResults> {
        if request.k == 0 {
            return Err(Error::Config("k must be greater than zero".into()));
        }

        let name = match (&request.index_name, self.bound_index()) {
            (Some(name), _) => name.clone(),
            (None, Some(bound)) => bound.name.clone(),
            (None, None) => return Err(Error::NoIndexBound),
        };
        validate_index_name(&name)?;

        let queries = request.query.texts();
        if queries.is_empty() {
            return Ok(SearchResults::Batch(Vec::new()));
        }

        let options = SearchOptions {
            k: request.k,
            force_fast: request.force_fast,
            extra: request.extra.clone(),
        };
        debug!(
            index = %name,
            queries = queries.len(),
            k = request.k,
            force_fast = request.force_fast,
            "searching"
        );
        let per_query = self.model.search(&queries, &name, &options)?;

        Ok(search::assemble(
            &request.query,
            per_query,
            request.zero_index_ranks,
        ))
    }

    /// Convenience for a single query against the bound index.
    pub fn search_one(&mut self, query: &str, k: usize) -> Result<SearchResults> {
        self.search(&SearchRequest::new(Query::from(query)).k(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_model::InMemoryModel;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn overwrite_policy_from_bool() {
        assert_eq!(OverwritePolicy::from(true), OverwritePolicy::ForceOverwrite);
        assert_eq!(OverwritePolicy::from(false), OverwritePolicy::Reuse);
        assert_eq!(OverwritePolicy::default(), OverwritePolicy::ForceOverwrite);

        let policy: OverwritePolicy =
            serde_json::from_str("\"fail_if_exists\"").unwrap();
        assert_eq!(policy, OverwritePolicy::FailIfExists);
    }

    #[test]
    fn default_index_name_uses_model_basename() {
        let search = NeuralSearch::with_model(InMemoryModel::new(
            "lightonai/GTE-ModernColBERT-v1",
            256,
        ));
        assert_eq!(
            search.default_index_name(),
            "GTE-ModernColBERT-v1_new_index"
        );

        let local = NeuralSearch::with_model(InMemoryModel::new("/models/colbert/", 256));
        assert_eq!(local.default_index_name(), "colbert_new_index");
    }

    #[test]
    fn build_without_name_uses_default() {
        let mut search =
            NeuralSearch::with_model(InMemoryModel::new("org/tiny", 256));
        let index = search
            .index(texts(&["some text"]), &IndexOptions::default())
            .unwrap();
        assert_eq!(index.name, "tiny_new_index");
        assert!(matches!(search.state(), IndexBinding::Built(_)));
    }

    #[test]
    fn chunking_errors_come_before_anything_else() {
        let model = InMemoryModel::default();
        let mut search = NeuralSearch::with_model(model.clone());

        let options = IndexOptions::named("bad/name").max_document_length(0);
        let err = search.index(Vec::new(), &options).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("max_document_length"));
        assert!(model.calls().is_empty());
    }

    #[test]
    fn empty_collection_is_build_error_with_name() {
        let mut search = NeuralSearch::with_model(InMemoryModel::default());
        let err = search
            .index(Vec::new(), &IndexOptions::named("empty"))
            .unwrap_err();
        match err {
            Error::IndexBuild { name, .. } => assert_eq!(name, "empty"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_index_names_are_config_errors() {
        let mut search = NeuralSearch::with_model(InMemoryModel::default());
        for name in ["", "../up", ".hidden"] {
            let err = search
                .index(texts(&["x"]), &IndexOptions::named(name))
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{name:?}");
        }
    }

    #[test]
    fn split_documents_false_keeps_documents_whole() {
        let model = InMemoryModel::default();
        let mut search = NeuralSearch::with_model(model.clone());
        let long = "word ".repeat(100);

        search
            .index(
                vec![long.clone()],
                &IndexOptions::named("whole")
                    .split_documents(false)
                    .max_document_length(20),
            )
            .unwrap();

        let passages = model.passages("whole").unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].content, long);
    }

    #[test]
    fn chunked_build_uses_quarter_overlap() {
        let model = InMemoryModel::default();
        let mut search = NeuralSearch::with_model(model.clone());

        search
            .index(
                texts(&["abcdefghijklmnopqrstuvwxyz"]),
                &IndexOptions::named("fixed")
                    .chunker(ChunkerKind::FixedWidth)
                    .max_document_length(8),
            )
            .unwrap();

        let passages = model.passages("fixed").unwrap();
        let contents: Vec<_> =
            passages.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["abcdefgh", "ghijklmn", "mnopqrst", "stuvwxyz"]);
        assert!(passages.iter().all(|p| p.document_id == "0"));
        let chunk_indexes: Vec<_> =
            passages.iter().map(|p| p.chunk_index).collect();
        assert_eq!(chunk_indexes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn index_documents_rejects_conflicting_ids() {
        let mut search = NeuralSearch::with_model(InMemoryModel::default());
        let docs = vec![Document::new("a", "x"), Document::new("a", "y")];
        assert!(matches!(
            search.index_documents(docs.clone(), &IndexOptions::named("d")),
            Err(Error::Config(_))
        ));

        let options =
            IndexOptions::named("d").document_ids(texts(&["p", "q"]));
        assert!(matches!(
            search.index_documents(docs, &options),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn add_respects_index_document_length() {
        let mut search = NeuralSearch::with_model(InMemoryModel::default());
        search
            .index(
                texts(&["seed"]),
                &IndexOptions::named("docs").max_document_length(40),
            )
            .unwrap();

        let err = search
            .add_to_index(
                texts(&["more"]),
                &AddOptions::default().max_document_length(80),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let index = search
            .add_to_index(
                texts(&["more"]),
                &AddOptions::default().max_document_length(20),
            )
            .unwrap();
        assert_eq!(index.num_documents, 2);
        assert_eq!(index.doc_maxlen, 40);
    }

    #[test]
    fn search_rejects_zero_k() {
        let mut search = NeuralSearch::with_model(InMemoryModel::default());
        search
            .index(texts(&["text"]), &IndexOptions::named("idx"))
            .unwrap();
        assert!(matches!(
            search.search(&SearchRequest::new("text").k(0)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_batch_returns_empty_batch() {
        let model = InMemoryModel::default();
        let mut search = NeuralSearch::with_model(model.clone());
        search
            .index(texts(&["text"]), &IndexOptions::named("idx"))
            .unwrap();

        let results = search
            .search(&SearchRequest::new(Vec::<String>::new()))
            .unwrap();
        assert_eq!(results, SearchResults::Batch(Vec::new()));
        assert!(
            !model
                .calls()
                .iter()
                .any(|c| matches!(c, crate::memory_model::ModelCall::Search { .. }))
        );
    }

    #[test]
    fn search_one_targets_bound_index() {
        let mut search = NeuralSearch::with_model(InMemoryModel::default());
        search
            .index(
                texts(&["apples and pears", "engines and gears"]),
                &IndexOptions::named("idx"),
            )
            .unwrap();

        let results = search.search_one("gears", 1).unwrap();
        let hits = results.single().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "1");
        assert_eq!(hits[0].rank, 1);
    }
}
