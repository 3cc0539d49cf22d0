use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "MAGNET_DATA_DIR";

/// Storage root for persisted indexes.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path
    /// 2. The MAGNET_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/magnet/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("magnet")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every ColBERT index, one subdirectory per name.
    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join("colbert").join("indexes")
    }

    /// Directory of the index called `name`. The name is validated.
    pub fn index_dir(&self, name: &str) -> Result<PathBuf> {
        validate_index_name(name)?;
        Ok(self.indexes_dir().join(name))
    }
}

/// Index names become directory names: they must be non-empty, must not
/// start with a dot and must not contain path separators.
///
/// # Examples
///
/// ```
/// use magnet::data_dir::validate_index_name;
///
/// assert!(validate_index_name("docs_v2").is_ok());
/// assert!(validate_index_name("../escape").is_err());
/// ```
pub fn validate_index_name(name: &str) -> Result<()> {
    let problem = if name.trim().is_empty() {
        Some("must not be empty")
    } else if name.starts_with('.') {
        Some("must not start with '.'")
    } else if name.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if name.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };

    match problem {
        Some(problem) => Err(Error::Config(format!(
            "invalid index name '{name}': {problem}"
        ))),
        None => Ok(()),
    }
}
