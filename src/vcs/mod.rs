//! Version-control adapter.
//!
//! The working tree is the single shared mutable resource of the pipeline.
//! Everything that changes it (branch switches, commits, merges, resets) goes
//! through [`VersionControl`], and callers hold a [`WorkTreeLock`] while doing so.

mod conflict;
mod git;
mod lock;

pub use conflict::{has_conflict_markers, split_conflict, ConflictSides};
pub use git::GitRepo;
pub use lock::{LockError, WorkTreeLock};

use std::path::Path;

use async_trait::async_trait;

/// Errors from version-control operations.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to run git: {0}")]
    Spawn(String),

    #[error("{0}")]
    Other(String),
}

/// Outcome of `merge --no-commit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub conflict: bool,
    /// Paths left with unresolved markers (empty unless `conflict`).
    pub files: Vec<String>,
}

impl MergeOutcome {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn conflicted(files: Vec<String>) -> Self {
        Self {
            conflict: true,
            files,
        }
    }
}

/// Which side of an in-progress merge to take wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSide {
    /// The branch being merged into (mainline).
    Ours,
    /// The incoming feature branch.
    Theirs,
}

/// Operations the pipeline needs from version control.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Root of the working tree.
    fn workdir(&self) -> &Path;

    /// Name of the mainline branch.
    fn mainline(&self) -> &str;

    async fn branch_exists(&self, name: &str) -> Result<bool, VcsError>;

    async fn current_branch(&self) -> Result<String, VcsError>;

    /// Check out `name`, creating it from `base` first if missing.
    /// Returns `true` when the branch was created.
    async fn create_or_checkout(&self, name: &str, base: &str) -> Result<bool, VcsError>;

    async fn checkout(&self, name: &str) -> Result<(), VcsError>;

    /// Stage everything and commit. `Ok(None)` when there was nothing to commit.
    async fn commit_all(&self, message: &str) -> Result<Option<String>, VcsError>;

    /// Stage specific paths.
    async fn stage(&self, paths: &[String]) -> Result<(), VcsError>;

    /// Merge `branch` into the current branch without committing.
    async fn merge_no_commit(&self, branch: &str) -> Result<MergeOutcome, VcsError>;

    async fn abort_merge(&self) -> Result<(), VcsError>;

    /// Conclude an in-progress merge. Returns the resulting HEAD hash.
    async fn commit_merge(&self, message: &str) -> Result<String, VcsError>;

    /// Paths that still have unmerged index entries.
    async fn unresolved_files(&self) -> Result<Vec<String>, VcsError>;

    /// Replace a conflicted path with one side and stage it.
    async fn checkout_side(&self, path: &str, side: MergeSide) -> Result<(), VcsError>;

    /// Read `path` as committed on `branch`, without touching the working tree.
    async fn show_file_at(&self, branch: &str, path: &str) -> Result<String, VcsError>;

    async fn head(&self) -> Result<String, VcsError>;

    /// Fast-forward mainline from the remote.
    async fn update_mainline(&self) -> Result<(), VcsError>;

    /// Return mainline to `commit`, discarding later merges and any merge
    /// in progress.
    async fn reset_hard(&self, commit: &str) -> Result<(), VcsError>;

    /// Drop uncommitted changes and untracked files on the current branch.
    /// Pipeline state under `.twinspawn/` is kept.
    async fn discard_changes(&self) -> Result<(), VcsError>;

    async fn push(&self) -> Result<(), VcsError>;
}
