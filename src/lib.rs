//! magnet - index lifecycle and chunking in front of ColBERT late-interaction
//! retrieval.
//!
//! magnet turns collections of texts into passages, builds named indexes for
//! them and answers single or batched queries with ranked passages. Indexes
//! are built, reused or refused according to an [`OverwritePolicy`], and
//! writers to the same index never overlap. The retrieval itself sits behind
//! the [`RetrievalModel`] trait: [`ColbertModel`] encodes with
//! [pylate-rs](https://github.com/lightonai/pylate-rs) and persists its
//! indexes under the [`DataDir`], while [`InMemoryModel`] ranks with BM25 and
//! keeps nothing on disk.
//!
//! # Quick start
//!
//! ```no_run
//! use magnet::{IndexOptions, NeuralSearch, OverwritePolicy, SearchRequest};
//!
//! let mut search =
//!     NeuralSearch::load_pretrained("lightonai/GTE-ModernColBERT-v1").unwrap();
//!
//! search
//!     .index(
//!         vec![
//!             "Ownership rules are checked at compile time.".to_string(),
//!             "Tantivy is a full-text search engine library.".to_string(),
//!         ],
//!         &IndexOptions::named("notes").overwrite(OverwritePolicy::Reuse),
//!     )
//!     .unwrap();
//!
//! let results = search
//!     .search(&SearchRequest::new("who checks ownership?").k(3))
//!     .unwrap();
//! for r in results.single().unwrap() {
//!     println!("{} {} (score: {:.3})", r.rank, r.document_id, r.score);
//! }
//! ```

pub mod chunking;
pub mod colbert;
pub mod corpus;
pub mod data_dir;
pub mod embedding;
pub mod embedding_db;
pub mod error;
pub mod index_lock;
pub mod logging;
pub mod memory_model;
pub mod model_manager;
pub mod neural_search;
pub mod reranker;
pub mod retrieval;
pub mod search;
pub mod tantivy_index;
pub mod text_splitter;
pub mod walker;

pub use chunking::{ChunkerKind, ChunkingConfig, ChunkingStrategy};
pub use colbert::ColbertModel;
pub use corpus::{Document, Passage};
pub use data_dir::DataDir;
pub use embedding_db::EmbeddingDb;
pub use error::{Error, Result};
pub use logging::init_tracing;
pub use memory_model::InMemoryModel;
pub use model_manager::ModelManager;
pub use neural_search::{
    AddOptions,
    IndexBinding,
    IndexOptions,
    NeuralSearch,
    OverwritePolicy,
};
pub use retrieval::{IndexRef, ModelConfig, RetrievalModel, SearchOptions};
pub use search::{Query, SearchRequest, SearchResult, SearchResults};
pub use text_splitter::RecursiveSplitter;
