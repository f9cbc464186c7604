//! Fixtures shared by unit tests: a scripted gateway, an in-memory version
//! control fake, and a throwaway git repository.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{ChatMessage, ChatResponse, LlmClient, TokenUsage, ToolCall, ToolDefinition};
use crate::vcs::{GitRepo, MergeOutcome, MergeSide, VcsError, VersionControl};

/// Assistant turn that calls `(id, name, arguments)` in order.
pub fn tool_reply(calls: Vec<(&str, &str, Value)>) -> ChatResponse {
    ChatResponse {
        tool_calls: Some(
            calls
                .into_iter()
                .map(|(id, name, args)| ToolCall::new(id, name, args))
                .collect(),
        ),
        usage: Some(TokenUsage::new(10, 5)),
        ..ChatResponse::default()
    }
}

/// Assistant turn with text only.
pub fn text_reply(text: &str) -> ChatResponse {
    ChatResponse {
        content: Some(text.to_string()),
        usage: Some(TokenUsage::new(10, 5)),
        ..ChatResponse::default()
    }
}

pub type Transcripts = Arc<Mutex<Vec<Vec<ChatMessage>>>>;

/// Replays canned responses in order; errors once the script runs out.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<ChatResponse>>,
    repeat: Option<ChatResponse>,
    transcripts: Transcripts,
}

impl ScriptedLlm {
    pub fn new(script: Vec<ChatResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            transcripts: Arc::default(),
        }
    }

    /// Returns `response` forever.
    pub fn repeating(response: ChatResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(vec![])
        }
    }

    /// Every transcript the client was called with.
    pub fn transcripts(&self) -> Transcripts {
        self.transcripts.clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        self.transcripts.lock().unwrap().push(messages.to_vec());
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return Ok(next);
        }
        match &self.repeat {
            Some(response) => Ok(response.clone()),
            None => anyhow::bail!("script exhausted"),
        }
    }
}

#[derive(Default)]
struct FakeState {
    current: String,
    branches: BTreeSet<String>,
    commits: usize,
    head: String,
    remote_head: String,
    nothing_to_commit: bool,
    conflicts: BTreeMap<String, Vec<String>>,
    pending: Option<(String, Vec<String>)>,
    staged: Vec<String>,
    fail_update: bool,
    fail_push: bool,
    log: Vec<String>,
}

/// In-memory [`VersionControl`] that records every mutating call.
pub struct FakeVcs {
    workdir: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeVcs {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        let state = FakeState {
            current: "main".into(),
            branches: BTreeSet::from(["main".to_string()]),
            head: "base".into(),
            remote_head: "base".into(),
            ..FakeState::default()
        };
        Self {
            workdir: workdir.into(),
            state: Mutex::new(state),
        }
    }

    /// Merging `branch` will stop on these files.
    pub fn conflict_on(&self, branch: &str, files: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .conflicts
            .insert(branch.to_string(), files.iter().map(|f| f.to_string()).collect());
    }

    pub fn set_nothing_to_commit(&self, value: bool) {
        self.state.lock().unwrap().nothing_to_commit = value;
    }

    pub fn fail_update(&self) {
        self.state.lock().unwrap().fail_update = true;
    }

    pub fn fail_push(&self) {
        self.state.lock().unwrap().fail_push = true;
    }

    pub fn add_branch(&self, name: &str) {
        self.state.lock().unwrap().branches.insert(name.to_string());
    }

    /// Mutating operations, in order, e.g. `"merge twin/task-1"`.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn staged(&self) -> Vec<String> {
        self.state.lock().unwrap().staged.clone()
    }

    pub fn current(&self) -> String {
        self.state.lock().unwrap().current.clone()
    }

    pub fn head_now(&self) -> String {
        self.state.lock().unwrap().head.clone()
    }

    pub fn remote_head(&self) -> String {
        self.state.lock().unwrap().remote_head.clone()
    }

    fn next_hash(state: &mut FakeState) -> String {
        state.commits += 1;
        state.head = format!("c{}", state.commits);
        state.head.clone()
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn mainline(&self) -> &str {
        "main"
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, VcsError> {
        Ok(self.state.lock().unwrap().branches.contains(name))
    }

    async fn current_branch(&self) -> Result<String, VcsError> {
        Ok(self.current())
    }

    async fn create_or_checkout(&self, name: &str, _base: &str) -> Result<bool, VcsError> {
        let mut state = self.state.lock().unwrap();
        let created = state.branches.insert(name.to_string());
        state.current = name.to_string();
        state.log.push(format!("checkout {}", name));
        Ok(created)
    }

    async fn checkout(&self, name: &str) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        if !state.branches.contains(name) {
            return Err(VcsError::Other(format!("no branch {}", name)));
        }
        state.current = name.to_string();
        state.log.push(format!("checkout {}", name));
        Ok(())
    }

    async fn commit_all(&self, message: &str) -> Result<Option<String>, VcsError> {
        let mut state = self.state.lock().unwrap();
        if state.nothing_to_commit {
            return Ok(None);
        }
        let current = state.current.clone();
        state.log.push(format!("commit {}: {}", current, message));
        Ok(Some(Self::next_hash(&mut state)))
    }

    async fn stage(&self, paths: &[String]) -> Result<(), VcsError> {
        self.state.lock().unwrap().staged.extend(paths.iter().cloned());
        Ok(())
    }

    async fn merge_no_commit(&self, branch: &str) -> Result<MergeOutcome, VcsError> {
        let mut state = self.state.lock().unwrap();
        if !state.branches.contains(branch) {
            return Err(VcsError::Other(format!("no branch {}", branch)));
        }
        state.log.push(format!("merge {}", branch));
        let files = state.conflicts.get(branch).cloned().unwrap_or_default();
        state.pending = Some((branch.to_string(), files.clone()));
        if files.is_empty() {
            Ok(MergeOutcome::clean())
        } else {
            Ok(MergeOutcome::conflicted(files))
        }
    }

    async fn abort_merge(&self) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        if state.pending.take().is_none() {
            return Err(VcsError::Other("no merge in progress".into()));
        }
        state.log.push("abort".into());
        Ok(())
    }

    async fn commit_merge(&self, message: &str) -> Result<String, VcsError> {
        let mut state = self.state.lock().unwrap();
        state.pending = None;
        state.log.push(format!("commit-merge: {}", message));
        Ok(Self::next_hash(&mut state))
    }

    async fn unresolved_files(&self) -> Result<Vec<String>, VcsError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pending
            .as_ref()
            .map(|(_, files)| {
                files
                    .iter()
                    .filter(|f| !state.staged.contains(f))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn checkout_side(&self, path: &str, _side: MergeSide) -> Result<(), VcsError> {
        self.state.lock().unwrap().staged.push(path.to_string());
        Ok(())
    }

    async fn show_file_at(&self, branch: &str, path: &str) -> Result<String, VcsError> {
        Err(VcsError::Other(format!("{}:{} not tracked by fake", branch, path)))
    }

    async fn head(&self) -> Result<String, VcsError> {
        Ok(self.head_now())
    }

    async fn update_mainline(&self) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        state.current = "main".into();
        state.log.push("update".into());
        if state.fail_update {
            return Err(VcsError::Other("remote unreachable".into()));
        }
        Ok(())
    }

    async fn reset_hard(&self, commit: &str) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        state.pending = None;
        state.current = "main".into();
        state.head = commit.to_string();
        state.log.push(format!("reset {}", commit));
        Ok(())
    }

    async fn discard_changes(&self) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        let current = state.current.clone();
        state.log.push(format!("discard {}", current));
        Ok(())
    }

    async fn push(&self) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        state.log.push("push".into());
        if state.fail_push {
            return Err(VcsError::Other("push rejected".into()));
        }
        state.remote_head = state.head.clone();
        Ok(())
    }
}

/// Fresh repository on `main` with one commit (`lib.txt`), plus a bare `origin`.
pub async fn init_repo() -> (tempfile::TempDir, GitRepo) {
    let dir = tempfile::tempdir().expect("tempdir");
    let work = dir.path().join("work");
    let origin = dir.path().join("origin.git");
    std::fs::create_dir_all(&work).unwrap();

    let git = |args: &[&str], cwd: &Path| {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("git available");
        assert!(status.success(), "git {:?} failed", args);
    };

    git(&["init", "--bare", origin.to_str().unwrap()], dir.path());
    git(&["init"], &work);
    git(&["checkout", "-b", "main"], &work);
    git(&["config", "user.name", "Test"], &work);
    git(&["config", "user.email", "test@example.com"], &work);
    git(&["config", "commit.gpgsign", "false"], &work);
    std::fs::write(work.join("lib.txt"), "base\n").unwrap();
    git(&["add", "-A"], &work);
    git(&["commit", "-m", "initial"], &work);
    git(&["remote", "add", "origin", origin.to_str().unwrap()], &work);
    git(&["push", "origin", "main"], &work);

    (dir, GitRepo::new(&work, "main", "origin"))
}
