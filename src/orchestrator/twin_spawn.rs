//! Twin-Spawn: one task through Implementer then Verifier, with bounded retries.
//!
//! # Invariants
//! - Implementer invocations per run `<= max_retries + 1`
//! - After `run` returns `Ok`, the task is GREEN, RED or SPLIT, never WORKING
//!   (TODO only when the run was cancelled)
//! - A commit on the task branch always precedes the Verifier
//! - Uncommitted work never leaves the task branch

use std::sync::Arc;

use serde::Serialize;

use crate::agents::{AgentRunResult, AgentRuntime, Implementer, RetryFeedback, RunStatus, Verifier, CANCELLED};
use crate::config::Config;
use crate::llm::TokenUsage;
use crate::task::{NewTask, Task, TaskError, TaskId, TaskRepository, TaskStatus, TaskUpdate};
use crate::vcs::VersionControl;

/// How one Twin-Spawn run ended.
#[derive(Debug, Clone, Serialize)]
pub struct TwinSpawnOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Implementer invocations.
    pub attempts: usize,
    pub error: Option<String>,
    /// Tasks created by a split.
    pub children: Vec<TaskId>,
    pub usage: TokenUsage,
}

pub struct TwinSpawn {
    repo: Arc<dyn TaskRepository>,
    vcs: Arc<dyn VersionControl>,
    runtime: AgentRuntime,
    config: Arc<Config>,
}

/// Progress of a run, carried into whatever terminal status it reaches.
struct Attempt {
    number: usize,
    usage: TokenUsage,
}

impl TwinSpawn {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        vcs: Arc<dyn VersionControl>,
        runtime: AgentRuntime,
        config: Arc<Config>,
    ) -> Self {
        Self {
            repo,
            vcs,
            runtime,
            config,
        }
    }

    /// Deterministic branch for a task.
    pub fn branch_name(prefix: &str, id: TaskId) -> String {
        format!("{}task-{}", prefix, id)
    }

    /// Drive `task` to GREEN, RED or SPLIT.
    ///
    /// # Errors
    /// Only task-store failures. Version-control and gateway failures end
    /// the task RED instead.
    pub async fn run(&self, task: &Task) -> Result<TwinSpawnOutcome, TaskError> {
        let branch = Self::branch_name(&self.config.branch_prefix, task.id);
        let task = self
            .repo
            .update(
                task.id,
                TaskUpdate::status(TaskStatus::Working)
                    .with_branch(&branch)
                    .clear_error(),
            )
            .await?;
        tracing::info!("Task {} WORKING on {}", task.id, branch);

        let mut attempt = Attempt {
            number: 0,
            usage: TokenUsage::default(),
        };
        let outcome = match self.drive(&task, &branch, &mut attempt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Task {} aborted by infrastructure error: {:#}", task.id, e);
                self.settle(&task, TaskStatus::Red, Some(format!("{:#}", e)), &attempt, vec![])
                    .await?
            }
        };

        self.leave_branch(&task, &branch).await;
        Ok(outcome)
    }

    /// Drop whatever the run left uncommitted on its branch, then return to
    /// mainline. Nothing from an unfinished task may follow the checkout.
    async fn leave_branch(&self, task: &Task, branch: &str) {
        match self.vcs.current_branch().await {
            Ok(current) if current == branch => {
                if let Err(e) = self.vcs.discard_changes().await {
                    tracing::warn!("Failed to clean {} after task {}: {}", branch, task.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not read the current branch after task {}: {}", task.id, e),
        }

        if let Err(e) = self.vcs.checkout(self.vcs.mainline()).await {
            tracing::warn!("Failed to return to {} after task {}: {}", self.vcs.mainline(), task.id, e);
        }
    }

    async fn drive(&self, task: &Task, branch: &str, attempt: &mut Attempt) -> anyhow::Result<TwinSpawnOutcome> {
        self.vcs.create_or_checkout(branch, self.vcs.mainline()).await?;

        let max_attempts = self.config.max_retries + 1;
        let mut feedback: Option<RetryFeedback> = None;

        while attempt.number < max_attempts {
            attempt.number += 1;
            tracing::info!("Task {} attempt {}/{}", task.id, attempt.number, max_attempts);

            let mut implementer = Implementer::new(
                task.clone(),
                self.vcs.workdir(),
                self.config.command_policy(),
                self.config.max_test_cases,
            );
            let implemented = self
                .runtime
                .run(&mut implementer, &Implementer::briefing(task, feedback.as_ref()))
                .await;
            attempt.usage = attempt.usage.add(&implemented.usage);

            match implemented.status {
                RunStatus::Done => {}
                RunStatus::Split => return Ok(self.split(task, &implemented, attempt).await?),
                _ if was_cancelled(&implemented) => return Ok(self.requeue(task, attempt).await?),
                _ => {
                    let error = implemented
                        .error
                        .unwrap_or_else(|| format!("implementer ended with status {}", implemented.status));
                    return Ok(self.settle(task, TaskStatus::Red, Some(error), attempt, vec![]).await?);
                }
            }

            let message = format!("task {}: {}", task.id.short(), headline(&task.description));
            match self.vcs.commit_all(&message).await? {
                Some(hash) => tracing::info!("Task {} committed {}", task.id, hash),
                None => tracing::info!("Task {} had nothing to commit", task.id),
            }

            let mut verifier = Verifier::new(
                self.vcs.clone(),
                task.clone(),
                &self.config.test_dir,
                self.config.command_policy(),
            );
            let verdict = self
                .runtime
                .run(&mut verifier, &Verifier::briefing(task, &self.config.test_dir))
                .await;
            attempt.usage = attempt.usage.add(&verdict.usage);

            match verdict.status {
                RunStatus::Approved => return Ok(self.approve(task, &verdict, attempt).await?),
                RunStatus::Rejected => {
                    let next = RetryFeedback::from_result(&verdict);
                    tracing::info!("Task {} rejected: {}", task.id, next.rejection_reason);
                    feedback = Some(next);
                }
                _ if was_cancelled(&verdict) => return Ok(self.requeue(task, attempt).await?),
                _ => {
                    let error = verdict
                        .error
                        .unwrap_or_else(|| format!("verifier ended with status {}", verdict.status));
                    return Ok(self.settle(task, TaskStatus::Red, Some(error), attempt, vec![]).await?);
                }
            }
        }

        let reason = feedback
            .map(|f| f.rejection_reason)
            .unwrap_or_else(|| "no reason given".to_string());
        let error = format!(
            "rejected after {} attempts ({} retries): {}",
            attempt.number, self.config.max_retries, reason
        );
        Ok(self.settle(task, TaskStatus::Red, Some(error), attempt, vec![]).await?)
    }

    async fn approve(
        &self,
        task: &Task,
        verdict: &AgentRunResult,
        attempt: &Attempt,
    ) -> Result<TwinSpawnOutcome, TaskError> {
        let message = format!("task {}: verifier tests", task.id.short());
        if let Err(e) = self.vcs.commit_all(&message).await {
            tracing::warn!("Failed to commit verifier tests for task {}: {}", task.id, e);
        }

        let mut update = TaskUpdate::status(TaskStatus::Green).clear_error();
        if let Some(path) = verdict.result_str("test_path") {
            update = update.with_test_path(path);
        }
        self.repo.update(task.id, update).await?;
        tracing::info!("Task {} GREEN after {} attempt(s)", task.id, attempt.number);

        Ok(TwinSpawnOutcome {
            task_id: task.id,
            status: TaskStatus::Green,
            attempts: attempt.number,
            error: None,
            children: vec![],
            usage: attempt.usage,
        })
    }

    async fn split(
        &self,
        task: &Task,
        implemented: &AgentRunResult,
        attempt: &Attempt,
    ) -> Result<TwinSpawnOutcome, TaskError> {
        let subtasks: Vec<NewTask> = serde_json::from_value(implemented.result["subtasks"].clone())
            .map_err(|e| TaskError::Storage(format!("malformed split payload: {}", e)))?;

        let mut children = Vec::with_capacity(subtasks.len());
        for subtask in subtasks {
            let child = self.repo.create(subtask.with_parent(task.id)).await?;
            children.push(child.id);
        }
        tracing::info!("Task {} SPLIT into {} subtasks", task.id, children.len());

        let reason = implemented.result_str("reason").map(String::from);
        self.settle(task, TaskStatus::Split, reason, attempt, children).await
    }

    /// Interrupted by shutdown: back to TODO for a later run.
    async fn requeue(&self, task: &Task, attempt: &Attempt) -> Result<TwinSpawnOutcome, TaskError> {
        tracing::info!("Task {} interrupted; requeued", task.id);
        self.settle(task, TaskStatus::Todo, Some("interrupted by shutdown".to_string()), attempt, vec![])
            .await
    }

    async fn settle(
        &self,
        task: &Task,
        status: TaskStatus,
        error: Option<String>,
        attempt: &Attempt,
        children: Vec<TaskId>,
    ) -> Result<TwinSpawnOutcome, TaskError> {
        let mut update = TaskUpdate::status(status);
        if let Some(error) = &error {
            update = update.with_error(error.clone());
        }
        self.repo.update(task.id, update).await?;
        if status == TaskStatus::Red {
            tracing::warn!("Task {} RED: {}", task.id, error.as_deref().unwrap_or_default());
        }

        Ok(TwinSpawnOutcome {
            task_id: task.id,
            status,
            attempts: attempt.number,
            error,
            children,
            usage: attempt.usage,
        })
    }
}

fn was_cancelled(result: &AgentRunResult) -> bool {
    result.status == RunStatus::Failed && result.error.as_deref() == Some(CANCELLED)
}

/// First line of a description, clipped for a commit subject.
fn headline(description: &str) -> String {
    let line = description.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= 60 {
        line.to_string()
    } else {
        format!("{}...", line.chars().take(57).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatResponse;
    use crate::task::InMemoryTaskStore;
    use crate::test_support::{init_repo, tool_reply, FakeVcs, ScriptedLlm};
    use crate::vcs::GitRepo;
    use serde_json::json;

    struct Harness {
        _dir: tempfile::TempDir,
        repo: Arc<InMemoryTaskStore>,
        vcs: Arc<FakeVcs>,
        twin: TwinSpawn,
        llm: Arc<ScriptedLlm>,
    }

    fn harness(script: Vec<ChatResponse>) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new("test-key".into(), dir.path().to_path_buf());
        config.allowed_commands.push("sh".into());
        let config = Arc::new(config);
        let repo = Arc::new(InMemoryTaskStore::new(config.max_test_cases));
        let vcs = Arc::new(FakeVcs::new(dir.path()));
        let llm = Arc::new(ScriptedLlm::new(script));
        let runtime = AgentRuntime::new(llm.clone(), "m").with_max_iterations(5);
        let twin = TwinSpawn::new(repo.clone(), vcs.clone(), runtime, config);
        Harness {
            _dir: dir,
            repo,
            vcs,
            twin,
            llm,
        }
    }

    fn implementer_done() -> ChatResponse {
        tool_reply(vec![("i", "task_complete", json!({"summary": "implemented"}))])
    }

    /// Verifier writes one test and stages it.
    fn verifier_authors() -> ChatResponse {
        tool_reply(vec![
            ("w", "write_file", json!({"path": "tests/twin/t.sh", "content": "exit 0"})),
            ("f", "finish_tests", json!({"test_command": "sh tests/twin/t.sh"})),
        ])
    }

    fn verifier_approves(tests_passed: u32) -> ChatResponse {
        tool_reply(vec![("a", "approve", json!({"tests_passed": tests_passed, "summary": "ok"}))])
    }

    fn verifier_rejects(reason: &str) -> ChatResponse {
        tool_reply(vec![("r", "reject", json!({"reason": reason, "failed_tests": ["t"]}))])
    }

    /// Runs started, counted by their opening transcript.
    fn implementer_calls(llm: &ScriptedLlm) -> usize {
        let transcripts = llm.transcripts();
        let seen = transcripts.lock().unwrap();
        let count = seen
            .iter()
            .filter(|t| t.len() == 2)
            .filter(|t| t[0].content.as_deref().is_some_and(|c| c.starts_with("You are the Implementer")))
            .count();
        count
    }

    #[tokio::test]
    async fn clean_task_goes_green() {
        let h = harness(vec![implementer_done(), verifier_authors(), verifier_approves(5)]);
        let task = h.repo.create(NewTask::new("add", "true", 5)).await.unwrap();

        let outcome = h.twin.run(&task).await.unwrap();

        assert_eq!(outcome.status, TaskStatus::Green);
        assert_eq!(outcome.attempts, 1);
        let stored = h.repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Green);
        assert_eq!(stored.test_path.as_deref(), Some("tests/twin/t.sh"));
        let branch = format!("twin/task-{}", task.id);
        assert_eq!(stored.branch.as_deref(), Some(branch.as_str()));
        assert_eq!(h.vcs.current(), "main");

        let log = h.vcs.log();
        let commit = log.iter().position(|l| l.starts_with(&format!("commit {}", branch))).unwrap();
        assert!(log[..commit].contains(&format!("checkout {}", branch)));
    }

    #[tokio::test]
    async fn exhausted_retries_go_red_with_last_reason() {
        let mut script = Vec::new();
        for reason in ["first", "second", "third", "fourth"] {
            script.push(implementer_done());
            script.push(verifier_authors());
            script.push(verifier_rejects(reason));
        }
        let h = harness(script);
        let task = h.repo.create(NewTask::new("add", "true", 3)).await.unwrap();

        let outcome = h.twin.run(&task).await.unwrap();

        assert_eq!(outcome.status, TaskStatus::Red);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(implementer_calls(&h.llm), 4);
        let error = h.repo.get(task.id).await.unwrap().unwrap().error.unwrap();
        assert!(error.contains("4 attempts"), "{}", error);
        assert!(error.ends_with("fourth"), "{}", error);
        assert_eq!(h.llm.remaining(), 0);
    }

    #[tokio::test]
    async fn retry_carries_feedback_then_succeeds() {
        let h = harness(vec![
            implementer_done(),
            verifier_authors(),
            verifier_rejects("overflow unhandled"),
            implementer_done(),
            verifier_authors(),
            verifier_approves(2),
        ]);
        let task = h.repo.create(NewTask::new("add", "true", 3)).await.unwrap();

        let outcome = h.twin.run(&task).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Green);
        assert_eq!(outcome.attempts, 2);

        let transcripts = h.llm.transcripts();
        let seen = transcripts.lock().unwrap();
        let retry_briefing = seen[3][1].content.clone().unwrap();
        assert!(retry_briefing.contains("overflow unhandled"));
        let first_briefing = seen[0][1].content.clone().unwrap();
        assert!(!first_briefing.contains("rejected"));
    }

    #[tokio::test]
    async fn implementer_failure_goes_red_without_verifier() {
        let h = harness(vec![tool_reply(vec![(
            "i",
            "task_failed",
            json!({"reason": "dependency missing"}),
        )])]);
        let task = h.repo.create(NewTask::new("add", "true", 3)).await.unwrap();

        let outcome = h.twin.run(&task).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Red);
        assert_eq!(outcome.error.as_deref(), Some("dependency missing"));
        assert!(!h.vcs.log().iter().any(|l| l.starts_with("commit")));
    }

    #[tokio::test]
    async fn split_creates_children_with_parent() {
        let h = harness(vec![tool_reply(vec![(
            "s",
            "split_task",
            json!({"reason": "two concerns", "subtasks": [
                {"description": "parse", "verification_command": "true", "estimated_test_cases": 2},
                {"description": "format", "verification_command": "true", "estimated_test_cases": 3, "dependencies": ["parse"]}
            ]}),
        )])]);
        let task = h.repo.create(NewTask::new("parse and format", "true", 7)).await.unwrap();

        let outcome = h.twin.run(&task).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Split);
        assert_eq!(outcome.children.len(), 2);

        let todo = h.repo.all_by_status(TaskStatus::Todo).await.unwrap();
        assert_eq!(todo.len(), 2);
        assert!(todo.iter().all(|t| t.parent_id == Some(task.id)));
        assert_eq!(todo[1].dependencies, vec!["parse".to_string()]);
    }

    #[tokio::test]
    async fn gateway_failure_never_leaves_working() {
        let h = harness(vec![implementer_done()]);
        let task = h.repo.create(NewTask::new("add", "true", 3)).await.unwrap();

        let outcome = h.twin.run(&task).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Red);
        assert!(outcome.error.unwrap().contains("gateway error"));
        assert!(h.repo.all_by_status(TaskStatus::Working).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nothing_to_commit_is_not_fatal() {
        let h = harness(vec![implementer_done(), verifier_authors(), verifier_approves(1)]);
        h.vcs.set_nothing_to_commit(true);
        let task = h.repo.create(NewTask::new("already done", "true", 1)).await.unwrap();

        let outcome = h.twin.run(&task).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Green);
    }

    #[tokio::test]
    async fn cancelled_run_requeues_instead_of_red() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(Config::new("test-key".into(), dir.path().to_path_buf()));
        let repo = Arc::new(InMemoryTaskStore::new(7));
        let vcs = Arc::new(FakeVcs::new(dir.path()));
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let runtime = AgentRuntime::new(Arc::new(ScriptedLlm::new(vec![])), "m").with_cancellation(token);
        let twin = TwinSpawn::new(repo.clone(), vcs.clone(), runtime, config);
        let task = repo.create(NewTask::new("add", "true", 3)).await.unwrap();

        let outcome = twin.run(&task).await.unwrap();

        assert_eq!(outcome.status, TaskStatus::Todo);
        let stored = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Todo);
        assert_eq!(vcs.current(), "main");
    }

    #[tokio::test]
    async fn unfinished_work_never_reaches_the_next_task() {
        let (_dir, git) = init_repo().await;
        let work = git.workdir().to_path_buf();
        let vcs: Arc<GitRepo> = Arc::new(git);
        let mut config = Config::new("test-key".into(), work.clone());
        config.allowed_commands.push("sh".into());
        let config = Arc::new(config);
        let repo = Arc::new(InMemoryTaskStore::new(config.max_test_cases));
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_reply(vec![
                ("w", "write_file", json!({"path": "garbage.txt", "content": "half-done"})),
                ("x", "task_failed", json!({"reason": "gave up"})),
            ]),
            implementer_done(),
            verifier_authors(),
            verifier_approves(1),
        ]));
        let runtime = AgentRuntime::new(llm, "m").with_max_iterations(5);
        let twin = TwinSpawn::new(repo.clone(), vcs.clone(), runtime, config.clone());
        let first = repo.create(NewTask::new("first", "true", 1)).await.unwrap();
        let second = repo.create(NewTask::new("second", "true", 1)).await.unwrap();

        assert_eq!(twin.run(&first).await.unwrap().status, TaskStatus::Red);
        assert_eq!(vcs.current_branch().await.unwrap(), "main");
        assert!(!work.join("garbage.txt").exists());

        assert_eq!(twin.run(&second).await.unwrap().status, TaskStatus::Green);
        let branch = TwinSpawn::branch_name(&config.branch_prefix, second.id);
        assert!(vcs.show_file_at(&branch, "garbage.txt").await.is_err());
        assert_eq!(vcs.show_file_at(&branch, "tests/twin/t.sh").await.unwrap(), "exit 0");
        assert!(!work.join("garbage.txt").exists());
    }

    #[tokio::test]
    async fn failed_task_branch_is_cleaned_before_checkout() {
        let h = harness(vec![tool_reply(vec![("x", "task_failed", json!({"reason": "gave up"}))])]);
        let task = h.repo.create(NewTask::new("add", "true", 3)).await.unwrap();

        h.twin.run(&task).await.unwrap();

        let log = h.vcs.log();
        let branch = format!("twin/task-{}", task.id);
        let discard = log.iter().position(|l| *l == format!("discard {}", branch)).unwrap();
        assert_eq!(log[discard + 1], "checkout main");
    }

    #[test]
    fn headline_clips_long_descriptions() {
        assert_eq!(headline("short\nmore detail"), "short");
        let long = "x".repeat(100);
        assert_eq!(headline(&long).chars().count(), 60);
    }
}
