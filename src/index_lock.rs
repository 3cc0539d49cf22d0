//! Single-writer discipline for indexes.
//!
//! Every mutating operation on an index holds an [`IndexWriteGuard`] for the
//! index's storage path. Writers on different paths proceed in parallel;
//! writers on the same path queue up. Readers never take the lock.
//!
//! Writers within this process queue on an in-memory registry. When the
//! index lives on disk the guard also holds an exclusive advisory lock on a
//! lock file next to it, which keeps writers in other processes out.

use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Condvar, LazyLock, Mutex, PoisonError},
};

use fs2::FileExt;
use tracing::{debug, trace};

use crate::error::Result;

struct Registry {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| Registry {
    held: Mutex::new(HashSet::new()),
    released: Condvar::new(),
});

/// Exclusive write access to one index path. Released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct IndexWriteGuard {
    path: PathBuf,
    // Closing the file releases the advisory lock.
    _lock_file: Option<File>,
}

impl IndexWriteGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IndexWriteGuard {
    fn drop(&mut self) {
        let mut held = REGISTRY
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.path);
        drop(held);
        REGISTRY.released.notify_all();
        trace!(path = %self.path.display(), "released index write lock");
    }
}

/// Block until no other writer holds `path`, then take it.
///
/// With a `lock_file`, also block until no other process holds an exclusive
/// lock on that file. The file and its parent directory are created.
pub fn lock_index(
    path: &Path,
    lock_file: Option<&Path>,
) -> Result<IndexWriteGuard> {
    let mut held = REGISTRY
        .held
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    while held.contains(path) {
        held = REGISTRY
            .released
            .wait(held)
            .unwrap_or_else(PoisonError::into_inner);
    }
    held.insert(path.to_path_buf());
    drop(held);

    // From here on the registry entry is released by the guard's drop, also
    // when opening or locking the file fails.
    let mut guard = IndexWriteGuard {
        path: path.to_path_buf(),
        _lock_file: None,
    };
    if let Some(lock_path) = lock_file {
        let file = open_lock_file(lock_path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if !is_contended(&e) {
                return Err(e.into());
            }
            debug!(
                lock = %lock_path.display(),
                "index is locked by another process, waiting"
            );
            file.lock_exclusive()?;
        }
        guard._lock_file = Some(file);
    }

    trace!(path = %path.display(), "acquired index write lock");
    Ok(guard)
}

/// Take `path` only if it is free, in this process and, with a
/// `lock_file`, in every other one.
pub fn try_lock_index(
    path: &Path,
    lock_file: Option<&Path>,
) -> Result<Option<IndexWriteGuard>> {
    let mut held = REGISTRY
        .held
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if !held.insert(path.to_path_buf()) {
        return Ok(None);
    }
    drop(held);

    let mut guard = IndexWriteGuard {
        path: path.to_path_buf(),
        _lock_file: None,
    };
    if let Some(lock_path) = lock_file {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => guard._lock_file = Some(file),
            Err(e) if is_contended(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(guard))
}

fn is_contended(e: &io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
        || e.kind() == io::ErrorKind::WouldBlock
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}
