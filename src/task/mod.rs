//! Task repository: tasks, their status machine, and the deploy log.
//!
//! Supports:
//! - `memory`: in-memory storage (non-persistent, for tests and dry runs)
//! - `sqlite`: SQLite database (default for the binary)

mod memory;
mod record;
mod sqlite;
#[allow(clippy::module_inception)]
mod task;

pub use memory::InMemoryTaskStore;
pub use record::{DeployOutcome, DeployRecord, UnresolvedConflict};
pub use sqlite::SqliteTaskStore;
pub use task::{
    check_estimate, dependencies_satisfied, select_next_todo, NewTask, Task, TaskError, TaskId,
    TaskStatus, TaskUpdate,
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};

/// Fixed-width RFC 3339 timestamp, so string order is time order.
pub fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Durable task state.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Whether this store survives restarts.
    fn is_persistent(&self) -> bool;

    /// Upper bound enforced on `estimated_test_cases`.
    fn max_test_cases(&self) -> u32;

    /// Persist a TODO task. Invalid requests persist nothing.
    async fn create(&self, task: NewTask) -> Result<Task, TaskError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskError>;

    /// Apply a partial update and return the stored result.
    async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, TaskError>;

    /// Oldest TODO task with satisfied dependencies.
    async fn next_todo(&self) -> Result<Option<Task>, TaskError>;

    async fn all_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, TaskError>;

    /// Every task in creation order.
    async fn all(&self) -> Result<Vec<Task>, TaskError>;

    async fn append_deploy_record(&self, record: DeployRecord) -> Result<(), TaskError>;

    /// Deploy records, oldest first.
    async fn deploy_records(&self) -> Result<Vec<DeployRecord>, TaskError>;
}
