//! Pipeline driver: decomposition, per-task Twin-Spawn runs and deploy
//! cycles, serialized through the work-tree lock.

mod deploy;
mod twin_spawn;

pub use deploy::DeployCycle;
pub use twin_spawn::{TwinSpawn, TwinSpawnOutcome};

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRuntime, Decomposer, RunStatus};
use crate::config::Config;
use crate::llm::{LlmClient, TokenUsage};
use crate::task::{DeployRecord, Task, TaskError, TaskId, TaskRepository, TaskStatus, TaskUpdate};
use crate::vcs::{LockError, VersionControl, WorkTreeLock};

/// Errors that stop an orchestrator entry point.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Result of one decomposition request.
#[derive(Debug, Clone, Serialize)]
pub struct DecomposeOutcome {
    pub status: RunStatus,
    pub task_ids: Vec<TaskId>,
    pub error: Option<String>,
    pub usage: TokenUsage,
}

/// Result of draining the TODO queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// WORKING tasks requeued before the run.
    pub recovered: Vec<TaskId>,
    pub outcomes: Vec<TwinSpawnOutcome>,
    /// TODO tasks left waiting on dependencies that never went GREEN.
    pub blocked: usize,
    pub cancelled: bool,
}

/// Snapshot of the task store.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub counts: Vec<(TaskStatus, usize)>,
    pub tasks: Vec<Task>,
    pub last_deploy: Option<DeployRecord>,
}

pub struct Orchestrator {
    repo: Arc<dyn TaskRepository>,
    vcs: Arc<dyn VersionControl>,
    llm: Arc<dyn LlmClient>,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        vcs: Arc<dyn VersionControl>,
        llm: Arc<dyn LlmClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            repo,
            vcs,
            llm,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between tasks, and interrupt agent loops, once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn runtime(&self) -> AgentRuntime {
        AgentRuntime::new(self.llm.clone(), self.config.default_model.clone())
            .with_max_iterations(self.config.max_iterations)
            .with_cancellation(self.cancel.clone())
    }

    fn lock(&self) -> Result<WorkTreeLock, LockError> {
        let lock = WorkTreeLock::try_acquire(self.vcs.workdir())?;
        tracing::debug!("Acquired {}", lock.path().display());
        Ok(lock)
    }

    /// Break a natural-language request into TODO tasks.
    pub async fn decompose(&self, request: &str) -> Result<DecomposeOutcome, OrchestratorError> {
        let _lock = self.lock()?;
        let mut decomposer = Decomposer::new(self.repo.clone(), self.vcs.workdir());
        let result = self.runtime().run(&mut decomposer, request).await;

        tracing::info!(
            "Decomposition {} with {} task(s)",
            result.status,
            decomposer.created().len()
        );
        if result.status != RunStatus::Completed {
            let reason = result.error.as_deref().unwrap_or("decomposition did not complete");
            self.discard_partial_breakdown(decomposer.created(), reason).await?;
        }
        Ok(DecomposeOutcome {
            status: result.status,
            task_ids: decomposer.created().to_vec(),
            error: result.error,
            usage: result.usage,
        })
    }

    /// Tasks from an unfinished breakdown must never be picked up.
    async fn discard_partial_breakdown(&self, created: &[TaskId], reason: &str) -> Result<(), TaskError> {
        let error = format!("request not decomposed: {}", reason);
        for id in created {
            self.repo
                .update(*id, TaskUpdate::status(TaskStatus::Red).with_error(&error))
                .await?;
            tracing::warn!("Discarded task {} from an unfinished breakdown", id);
        }
        Ok(())
    }

    /// Take the next ready TODO task through Twin-Spawn.
    pub async fn tick(&self) -> Result<Option<TwinSpawnOutcome>, OrchestratorError> {
        let _lock = self.lock()?;
        self.tick_locked().await
    }

    async fn tick_locked(&self) -> Result<Option<TwinSpawnOutcome>, OrchestratorError> {
        let Some(task) = self.repo.next_todo().await? else {
            return Ok(None);
        };
        let twin = TwinSpawn::new(
            self.repo.clone(),
            self.vcs.clone(),
            self.runtime(),
            self.config.clone(),
        );
        Ok(Some(twin.run(&task).await?))
    }

    /// Recover, then tick until no TODO task is ready.
    pub async fn run_all(&self) -> Result<RunSummary, OrchestratorError> {
        let _lock = self.lock()?;
        let mut summary = RunSummary {
            recovered: self.recover_locked().await?,
            ..RunSummary::default()
        };

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Run cancelled after {} task(s)", summary.outcomes.len());
                summary.cancelled = true;
                break;
            }
            match self.tick_locked().await? {
                Some(outcome) => summary.outcomes.push(outcome),
                None => break,
            }
        }

        summary.blocked = self.repo.all_by_status(TaskStatus::Todo).await?.len();
        if summary.blocked > 0 && !summary.cancelled {
            tracing::warn!("{} TODO task(s) blocked on unmet dependencies", summary.blocked);
        }
        Ok(summary)
    }

    /// Requeue tasks left WORKING by an interrupted process.
    pub async fn recover(&self) -> Result<Vec<TaskId>, OrchestratorError> {
        let _lock = self.lock()?;
        Ok(self.recover_locked().await?)
    }

    async fn recover_locked(&self) -> Result<Vec<TaskId>, TaskError> {
        let stranded = self.repo.all_by_status(TaskStatus::Working).await?;
        let mut recovered = Vec::with_capacity(stranded.len());
        for task in stranded {
            self.repo
                .update(
                    task.id,
                    TaskUpdate::status(TaskStatus::Todo).with_error("requeued after an interrupted run"),
                )
                .await?;
            tracing::warn!("Requeued interrupted task {}", task.id);
            recovered.push(task.id);
        }

        if !recovered.is_empty() {
            if let Err(e) = self.vcs.checkout(self.vcs.mainline()).await {
                tracing::warn!("Could not return to {} during recovery: {}", self.vcs.mainline(), e);
            }
        }
        Ok(recovered)
    }

    /// Merge, integrate and push or roll back all GREEN branches.
    pub async fn deploy(&self) -> Result<DeployRecord, OrchestratorError> {
        let _lock = self.lock()?;
        let cycle = DeployCycle::new(
            self.repo.clone(),
            self.vcs.clone(),
            self.runtime(),
            self.config.clone(),
        );
        Ok(cycle.run().await?)
    }

    /// Counts per status, every task, and the latest deploy record.
    pub async fn status(&self) -> Result<StatusReport, OrchestratorError> {
        let tasks = self.repo.all().await?;
        let counts = TaskStatus::ALL
            .iter()
            .map(|status| (*status, tasks.iter().filter(|t| t.status == *status).count()))
            .collect();
        let last_deploy = self.repo.deploy_records().await?.pop();
        Ok(StatusReport {
            counts,
            tasks,
            last_deploy,
        })
    }
}
