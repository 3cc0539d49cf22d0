use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("lexical index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("index '{name}' not found at {}", path.display())]
    IndexNotFound { name: String, path: PathBuf },

    #[error("index '{name}' already exists")]
    IndexExists { name: String },

    #[error(
        "no index is bound: build or load an index, or pass an index name"
    )]
    NoIndexBound,

    #[error("failed to build index '{name}': {reason}")]
    IndexBuild { name: String, reason: String },

    #[error("failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("model inference error: {0}")]
    Inference(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    pub(crate) fn build(name: &str, reason: impl Into<String>) -> Self {
        Self::IndexBuild {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
