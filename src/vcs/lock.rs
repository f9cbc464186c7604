//! Exclusive ownership of the working tree across processes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("working tree is busy: {0} is held by another run")]
    Busy(PathBuf),

    #[error("failed to acquire working tree lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for the whole of a Twin-Spawn cycle or Deploy Cycle; released on drop.
#[derive(Debug)]
pub struct WorkTreeLock {
    file: File,
    path: PathBuf,
}

impl WorkTreeLock {
    /// Lock file location for a working tree. Lives inside `.git` so it is
    /// never committed; falls back to `.twinspawn/` for plain directories.
    pub fn path_for(workdir: &Path) -> PathBuf {
        let git_dir = workdir.join(".git");
        if git_dir.is_dir() {
            git_dir.join("twinspawn.lock")
        } else {
            workdir.join(".twinspawn").join("worktree.lock")
        }
    }

    /// Take the lock without waiting.
    ///
    /// # Errors
    /// [`LockError::Busy`] when another holder exists.
    pub fn try_acquire(workdir: &Path) -> Result<Self, LockError> {
        let path = Self::path_for(workdir);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!("Acquired working tree lock {}", path.display());
                Ok(Self { file, path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Err(LockError::Busy(path)),
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(LockError::Busy(path))
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkTreeLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release working tree lock {}: {}", self.path.display(), e);
        }
    }
}
