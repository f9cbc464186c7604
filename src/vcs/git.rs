//! [`VersionControl`] backed by the `git` command line.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use super::{MergeOutcome, MergeSide, VcsError, VersionControl};

/// Pipeline state inside the tree (task store, lock) is never staged.
const EXCLUDE_STATE: &str = ":(exclude).twinspawn";
const STATE_DIR: &str = ".twinspawn";

/// A git working tree.
pub struct GitRepo {
    workdir: PathBuf,
    mainline: String,
    remote: String,
    identity: Option<(String, String)>,
}

impl GitRepo {
    pub fn new(workdir: impl Into<PathBuf>, mainline: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            mainline: mainline.into(),
            remote: remote.into(),
            identity: None,
        }
    }

    /// Commit as this author instead of the repository's configured user.
    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.identity = Some((name.into(), email.into()));
        self
    }

    async fn output(&self, args: &[&str]) -> Result<Output, VcsError> {
        let mut command = Command::new("git");
        if let Some((name, email)) = &self.identity {
            command
                .arg("-c")
                .arg(format!("user.name={}", name))
                .arg("-c")
                .arg(format!("user.email={}", email));
        }
        command
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| VcsError::Spawn(e.to_string()))
    }

    /// Run git and return stdout, failing on a non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = self.output(args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(VcsError::CommandFailed {
                command: args.join(" "),
                stderr: if stderr.is_empty() { stdout.trim().to_string() } else { stderr },
            });
        }

        Ok(stdout)
    }

    async fn merge_in_progress(&self) -> Result<bool, VcsError> {
        let output = self.output(&["rev-parse", "-q", "--verify", "MERGE_HEAD"]).await?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl VersionControl for GitRepo {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn mainline(&self) -> &str {
        &self.mainline
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        let reference = format!("refs/heads/{}", name);
        let output = self.output(&["show-ref", "--verify", "--quiet", &reference]).await?;
        Ok(output.status.success())
    }

    async fn current_branch(&self) -> Result<String, VcsError> {
        Ok(self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?
            .trim()
            .to_string())
    }

    async fn create_or_checkout(&self, name: &str, base: &str) -> Result<bool, VcsError> {
        if self.branch_exists(name).await? {
            self.run(&["checkout", name]).await?;
            Ok(false)
        } else {
            self.run(&["checkout", "-b", name, base]).await?;
            Ok(true)
        }
    }

    async fn checkout(&self, name: &str) -> Result<(), VcsError> {
        self.run(&["checkout", name]).await.map(|_| ())
    }

    async fn commit_all(&self, message: &str) -> Result<Option<String>, VcsError> {
        self.run(&["add", "-A", "--", ".", EXCLUDE_STATE]).await?;

        let staged = self.output(&["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            return Ok(None);
        }

        self.run(&["commit", "-m", message]).await?;
        self.head().await.map(Some)
    }

    async fn stage(&self, paths: &[String]) -> Result<(), VcsError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args).await.map(|_| ())
    }

    async fn merge_no_commit(&self, branch: &str) -> Result<MergeOutcome, VcsError> {
        let output = self
            .output(&["merge", "--no-commit", "--no-ff", branch])
            .await?;

        if output.status.success() {
            return Ok(MergeOutcome::clean());
        }

        let files = self.unresolved_files().await?;
        if files.is_empty() {
            // Refused outright (unknown branch, dirty tree): no merge state to keep.
            if self.merge_in_progress().await? {
                let _ = self.abort_merge().await;
            }
            return Err(VcsError::CommandFailed {
                command: format!("merge {}", branch),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(MergeOutcome::conflicted(files))
    }

    async fn abort_merge(&self) -> Result<(), VcsError> {
        self.run(&["merge", "--abort"]).await.map(|_| ())
    }

    async fn commit_merge(&self, message: &str) -> Result<String, VcsError> {
        if !self.merge_in_progress().await? {
            // "Already up to date": nothing was left to commit.
            return self.head().await;
        }
        self.run(&["commit", "-m", message]).await?;
        self.head().await
    }

    async fn unresolved_files(&self) -> Result<Vec<String>, VcsError> {
        Ok(self
            .run(&["diff", "--name-only", "--diff-filter=U"])
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn checkout_side(&self, path: &str, side: MergeSide) -> Result<(), VcsError> {
        let flag = match side {
            MergeSide::Ours => "--ours",
            MergeSide::Theirs => "--theirs",
        };
        self.run(&["checkout", flag, "--", path]).await?;
        self.stage(&[path.to_string()]).await
    }

    async fn show_file_at(&self, branch: &str, path: &str) -> Result<String, VcsError> {
        let branch = branch.trim();
        if branch.is_empty() || branch.starts_with('-') {
            return Err(VcsError::Other(format!("invalid branch name: {:?}", branch)));
        }
        let object = format!("{}:{}", branch, path);
        self.run(&["cat-file", "-p", &object]).await
    }

    async fn head(&self) -> Result<String, VcsError> {
        Ok(self.run(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    async fn update_mainline(&self) -> Result<(), VcsError> {
        self.checkout(&self.mainline).await?;
        self.run(&["pull", "--ff-only", &self.remote, &self.mainline])
            .await
            .map(|_| ())
    }

    async fn reset_hard(&self, commit: &str) -> Result<(), VcsError> {
        if self.merge_in_progress().await? {
            self.abort_merge().await?;
        }
        self.checkout(&self.mainline).await?;
        self.run(&["reset", "--hard", commit]).await.map(|_| ())
    }

    async fn discard_changes(&self) -> Result<(), VcsError> {
        if self.merge_in_progress().await? {
            self.abort_merge().await?;
        }
        self.run(&["reset", "--hard", "HEAD"]).await?;
        self.run(&["clean", "-fd", "-e", STATE_DIR]).await.map(|_| ())
    }

    async fn push(&self) -> Result<(), VcsError> {
        self.run(&["push", &self.remote, &self.mainline]).await.map(|_| ())
    }
}
