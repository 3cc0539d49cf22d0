use std::path::{Path, PathBuf};

use crate::error::Result;

/// A text file found under a corpus directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusFile {
    /// Path relative to the corpus root, used as the document id.
    pub relative_path: PathBuf,
    /// Fully resolved path to read from.
    pub absolute_path: PathBuf,
}

impl CorpusFile {
    /// The relative path with `/` separators on every platform.
    pub fn document_id(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// File extensions loaded into a corpus.
pub const CORPUS_EXTENSIONS: &[&str] = &["md", "txt"];

/// Recursively collect the `.md` and `.txt` files under `root`, sorted by
/// relative path.
///
/// Hidden entries (names starting with `.`) and symlinked directories are
/// skipped. Symlinked files are followed.
pub fn discover_files(root: &Path) -> Result<Vec<CorpusFile>> {
    let root = root.canonicalize()?;
    let mut found = Vec::new();
    visit(&root, &root, &mut found)?;
    found.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(found)
}

fn visit(root: &Path, dir: &Path, found: &mut Vec<CorpusFile>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            visit(root, &path, found)?;
            continue;
        }

        let resolved = if file_type.is_symlink() {
            // Broken links are skipped.
            let Ok(target) = path.canonicalize() else {
                continue;
            };
            if target.is_dir() {
                continue;
            }
            target
        } else {
            path.clone()
        };

        if resolved.is_file() && has_corpus_extension(&resolved) {
            let relative_path =
                path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            found.push(CorpusFile {
                relative_path,
                absolute_path: resolved,
            });
        }
    }

    Ok(())
}

fn has_corpus_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CORPUS_EXTENSIONS.contains(&ext))
}
