//! Deploy cycle: merge every GREEN branch, run the integration suite, then
//! push or roll back.
//!
//! # Invariants
//! - Exactly one [`DeployRecord`] is appended per invocation
//! - A task becomes DEPLOYED only after its merge passed the integration suite
//! - Any failure after merging resets mainline to where it stood before the
//!   first merge, so earlier deploys that never reached the remote survive

use std::sync::Arc;

use crate::agents::{AgentRuntime, Integrator, RunStatus};
use crate::config::Config;
use crate::task::{
    now_string, DeployOutcome, DeployRecord, Task, TaskId, TaskRepository, TaskStatus, TaskUpdate,
    UnresolvedConflict,
};
use crate::tools::{run_sandboxed, truncate_output};
use crate::vcs::VersionControl;

/// Integration output kept in a failed record.
const MAX_RECORDED_OUTPUT: usize = 4000;

pub struct DeployCycle {
    repo: Arc<dyn TaskRepository>,
    vcs: Arc<dyn VersionControl>,
    runtime: AgentRuntime,
    config: Arc<Config>,
}

impl DeployCycle {
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

    /// Run one cycle. The caller holds the work-tree lock.
    ///
    /// # Errors
    /// Only when the record itself cannot be stored.
    pub async fn run(&self) -> Result<DeployRecord, crate::task::TaskError> {
        let mut record = DeployRecord::new(DeployOutcome::Success, now_string());
        let mut base = None;

        if let Err(e) = self.cycle(&mut record, &mut base).await {
            tracing::error!("Deploy cycle failed: {:#}", e);
            if let Some(base) = base.as_deref().filter(|_| !record.merged.is_empty()) {
                self.roll_back(base).await;
            }
            record.outcome = DeployOutcome::Failed;
            record.error = Some(format!("{:#}", e));
        }

        self.repo.append_deploy_record(record.clone()).await?;
        tracing::info!(
            "Deploy {}: {} attempted, {} merged, {} unresolved",
            record.outcome.as_str(),
            record.attempted.len(),
            record.merged.len(),
            record.conflicts.len()
        );
        Ok(record)
    }

    /// `base` receives mainline's head before the first merge.
    async fn cycle(&self, record: &mut DeployRecord, base: &mut Option<String>) -> anyhow::Result<()> {
        if let Err(e) = self.vcs.update_mainline().await {
            tracing::warn!("Could not update {} from remote: {}", self.vcs.mainline(), e);
            self.vcs.checkout(self.vcs.mainline()).await?;
        }

        let green: Vec<Task> = self
            .repo
            .all_by_status(TaskStatus::Green)
            .await?
            .into_iter()
            .filter(|t| t.branch.is_some())
            .collect();
        if green.is_empty() {
            tracing::info!("Nothing to deploy");
            return Ok(());
        }

        let start = self.vcs.head().await?;
        *base = Some(start.clone());

        let mut merged: Vec<TaskId> = Vec::new();
        for task in &green {
            let Some(branch) = task.branch.as_deref() else {
                continue;
            };
            record.attempted.push(branch.to_string());
            if self.merge_branch(task, branch, record).await {
                merged.push(task.id);
            }
        }

        if merged.is_empty() {
            tracing::info!("No branch merged cleanly; mainline unchanged");
            return Ok(());
        }

        let suite = run_sandboxed(
            &self.config.integration_test_command,
            self.vcs.workdir(),
            self.config.integration_timeout,
        )
        .await;
        let failure = match suite {
            Ok(output) if output.success() => None,
            Ok(output) => Some(format!(
                "integration suite failed:\n{}",
                truncate_output(&output.render(), MAX_RECORDED_OUTPUT)
            )),
            Err(e) => Some(format!("integration suite did not complete: {}", e)),
        };

        if let Some(error) = failure {
            tracing::warn!("{}", error);
            self.roll_back(&start).await;
            record.outcome = DeployOutcome::Failed;
            record.error = Some(error);
            return Ok(());
        }

        if let Err(e) = self.vcs.push().await {
            tracing::warn!("Push failed; mainline is ahead of the remote: {}", e);
        }
        for id in &merged {
            self.repo.update(*id, TaskUpdate::status(TaskStatus::Deployed)).await?;
        }
        record.commit_hash = Some(self.vcs.head().await?);
        tracing::info!("Deployed {} task(s)", merged.len());
        Ok(())
    }

    /// Merge one branch into mainline; `true` when it ends up merged.
    async fn merge_branch(&self, task: &Task, branch: &str, record: &mut DeployRecord) -> bool {
        let outcome = match self.vcs.merge_no_commit(branch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                record.conflicts.push(UnresolvedConflict {
                    branch: branch.to_string(),
                    files: vec![],
                    reason: e.to_string(),
                });
                return false;
            }
        };

        if !outcome.conflict {
            let message = format!("Merge {} (task {})", branch, task.id.short());
            return match self.vcs.commit_merge(&message).await {
                Ok(hash) => {
                    tracing::info!("Merged {} as {}", branch, hash);
                    record.merged.push(branch.to_string());
                    true
                }
                Err(e) => {
                    self.abort_merge(branch).await;
                    record.conflicts.push(UnresolvedConflict {
                        branch: branch.to_string(),
                        files: vec![],
                        reason: e.to_string(),
                    });
                    false
                }
            };
        }

        tracing::info!("Merging {} conflicts on {} file(s)", branch, outcome.files.len());
        let mut integrator = Integrator::new(self.vcs.clone(), branch, outcome.files.clone());
        let briefing = integrator.briefing();
        let resolution = self.runtime.run(&mut integrator, &briefing).await;

        if resolution.status == RunStatus::Resolved {
            record.merged.push(branch.to_string());
            record.resolved_files.extend(integrator.resolved_files());
            return true;
        }

        if resolution.status != RunStatus::Aborted {
            self.abort_merge(branch).await;
        }
        let reason = resolution
            .error
            .unwrap_or_else(|| format!("integrator ended with status {}", resolution.status));
        tracing::warn!("Left {} unmerged: {}", branch, reason);
        record.conflicts.push(UnresolvedConflict {
            branch: branch.to_string(),
            files: outcome.files,
            reason,
        });
        false
    }

    async fn abort_merge(&self, branch: &str) {
        if let Err(e) = self.vcs.abort_merge().await {
            tracing::warn!("Failed to abort merge of {}: {}", branch, e);
        }
    }

    async fn roll_back(&self, base: &str) {
        tracing::info!("Rolling {} back to {}", self.vcs.mainline(), base);
        if let Err(e) = self.vcs.reset_hard(base).await {
            tracing::error!("Rollback of {} failed: {}", self.vcs.mainline(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatResponse;
    use crate::task::{InMemoryTaskStore, NewTask};
    use crate::test_support::{tool_reply, FakeVcs, ScriptedLlm};
    use serde_json::json;

    struct Harness {
        _dir: tempfile::TempDir,
        repo: Arc<InMemoryTaskStore>,
        vcs: Arc<FakeVcs>,
        cycle: DeployCycle,
    }

    fn harness(suite: &str, script: Vec<ChatResponse>) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new("test-key".into(), dir.path().to_path_buf());
        config.integration_test_command = suite.to_string();
        let config = Arc::new(config);
        let repo = Arc::new(InMemoryTaskStore::new(config.max_test_cases));
        let vcs = Arc::new(FakeVcs::new(dir.path()));
        let runtime = AgentRuntime::new(Arc::new(ScriptedLlm::new(script)), "m").with_max_iterations(3);
        let cycle = DeployCycle::new(repo.clone(), vcs.clone(), runtime, config);
        Harness {
            _dir: dir,
            repo,
            vcs,
            cycle,
        }
    }

    async fn green_task(h: &Harness, name: &str) -> Task {
        let task = h.repo.create(NewTask::new(name, "true", 2)).await.unwrap();
        let branch = format!("twin/task-{}", name);
        h.vcs.add_branch(&branch);
        h.repo
            .update(task.id, TaskUpdate::status(TaskStatus::Working).with_branch(&branch))
            .await
            .unwrap();
        h.repo.update(task.id, TaskUpdate::status(TaskStatus::Green)).await.unwrap()
    }

    fn abort_reply(reason: &str) -> ChatResponse {
        tool_reply(vec![("a", "abort_resolution", json!({"reason": reason}))])
    }

    #[tokio::test]
    async fn clean_merges_deploy_and_push() {
        let h = harness("true", vec![]);
        let a = green_task(&h, "a").await;
        let b = green_task(&h, "b").await;

        let record = h.cycle.run().await.unwrap();

        assert_eq!(record.outcome, DeployOutcome::Success);
        assert_eq!(record.merged, vec!["twin/task-a", "twin/task-b"]);
        assert_eq!(record.commit_hash.as_deref(), Some("c2"));
        assert!(h.vcs.log().contains(&"push".to_string()));
        assert_eq!(h.vcs.remote_head(), "c2");
        for id in [a.id, b.id] {
            assert_eq!(h.repo.get(id).await.unwrap().unwrap().status, TaskStatus::Deployed);
        }
        assert_eq!(h.repo.deploy_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_suite_resets_and_keeps_green() {
        let h = harness("echo broken; false", vec![]);
        let a = green_task(&h, "a").await;

        let record = h.cycle.run().await.unwrap();

        assert_eq!(record.outcome, DeployOutcome::Failed);
        assert!(record.error.unwrap().contains("broken"));
        assert!(record.commit_hash.is_none());
        let log = h.vcs.log();
        assert!(log.contains(&"reset base".to_string()));
        assert!(!log.contains(&"push".to_string()));
        assert_eq!(h.vcs.head_now(), "base");
        assert_eq!(h.repo.get(a.id).await.unwrap().unwrap().status, TaskStatus::Green);
    }

    #[tokio::test]
    async fn aborted_conflicts_stay_green_with_entries() {
        let h = harness("true", vec![abort_reply("incompatible"), abort_reply("incompatible")]);
        let a = green_task(&h, "a").await;
        let b = green_task(&h, "b").await;
        h.vcs.conflict_on("twin/task-a", &["lib.txt"]);
        h.vcs.conflict_on("twin/task-b", &["lib.txt"]);

        let record = h.cycle.run().await.unwrap();

        assert_eq!(record.outcome, DeployOutcome::Success);
        assert!(record.merged.is_empty());
        assert_eq!(record.conflicts.len(), 2);
        assert_eq!(record.conflicts[0].files, vec!["lib.txt"]);
        assert_eq!(record.conflicts[0].reason, "incompatible");
        for id in [a.id, b.id] {
            assert_eq!(h.repo.get(id).await.unwrap().unwrap().status, TaskStatus::Green);
        }
        let aborts = h.vcs.log().iter().filter(|l| *l == "abort").count();
        assert_eq!(aborts, 2);
        assert!(!h.vcs.log().contains(&"push".to_string()));
    }

    #[tokio::test]
    async fn integrator_failure_aborts_merge_and_others_still_deploy() {
        // Script runs out, so the integrator sees a gateway error.
        let h = harness("true", vec![]);
        let a = green_task(&h, "a").await;
        let b = green_task(&h, "b").await;
        h.vcs.conflict_on("twin/task-a", &["lib.txt"]);

        let record = h.cycle.run().await.unwrap();

        assert_eq!(record.merged, vec!["twin/task-b"]);
        assert!(record.conflicts[0].reason.contains("gateway error"));
        assert!(h.vcs.log().contains(&"abort".to_string()));
        assert_eq!(h.repo.get(a.id).await.unwrap().unwrap().status, TaskStatus::Green);
        assert_eq!(h.repo.get(b.id).await.unwrap().unwrap().status, TaskStatus::Deployed);
    }

    #[tokio::test]
    async fn empty_cycle_is_a_trivial_success() {
        let h = harness("false", vec![]);

        let first = h.cycle.run().await.unwrap();
        let second = h.cycle.run().await.unwrap();

        for record in [&first, &second] {
            assert_eq!(record.outcome, DeployOutcome::Success);
            assert!(record.attempted.is_empty());
        }
        assert!(!h.vcs.log().iter().any(|l| l.starts_with("commit") || l == "push"));
        assert_eq!(h.repo.deploy_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_remote_is_not_fatal() {
        let h = harness("true", vec![]);
        h.vcs.fail_update();
        h.vcs.fail_push();
        let a = green_task(&h, "a").await;

        let record = h.cycle.run().await.unwrap();

        assert_eq!(record.outcome, DeployOutcome::Success);
        assert_eq!(h.repo.get(a.id).await.unwrap().unwrap().status, TaskStatus::Deployed);
    }

    #[tokio::test]
    async fn rollback_keeps_earlier_unpushed_deploys() {
        // The suite fails once a `fail` marker exists in the tree.
        let h = harness("test ! -f fail", vec![]);
        h.vcs.fail_update();
        h.vcs.fail_push();
        let a = green_task(&h, "a").await;

        let first = h.cycle.run().await.unwrap();
        assert_eq!(first.outcome, DeployOutcome::Success);
        assert_eq!(h.vcs.head_now(), "c1");
        assert_eq!(h.vcs.remote_head(), "base");

        let b = green_task(&h, "b").await;
        std::fs::write(h._dir.path().join("fail"), "").unwrap();
        let second = h.cycle.run().await.unwrap();

        assert_eq!(second.outcome, DeployOutcome::Failed);
        assert!(h.vcs.log().contains(&"reset c1".to_string()));
        assert_eq!(h.vcs.head_now(), "c1");
        assert_eq!(h.repo.get(a.id).await.unwrap().unwrap().status, TaskStatus::Deployed);
        assert_eq!(h.repo.get(b.id).await.unwrap().unwrap().status, TaskStatus::Green);
    }

    #[tokio::test]
    async fn missing_branch_is_recorded_not_fatal() {
        let h = harness("true", vec![]);
        let task = h.repo.create(NewTask::new("ghost", "true", 1)).await.unwrap();
        h.repo
            .update(task.id, TaskUpdate::status(TaskStatus::Working).with_branch("twin/gone"))
            .await
            .unwrap();
        h.repo.update(task.id, TaskUpdate::status(TaskStatus::Green)).await.unwrap();

        let record = h.cycle.run().await.unwrap();

        assert_eq!(record.attempted, vec!["twin/gone"]);
        assert_eq!(record.conflicts.len(), 1);
        assert_eq!(record.outcome, DeployOutcome::Success);
    }
}
