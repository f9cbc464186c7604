//! Core Task type and its status machine.
//!
//! # Invariants
//! - `0 < estimated_test_cases <= max_test_cases` at creation (checked by [`NewTask::validate`])
//! - `id` is unique within a repository

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight hex digits, for branch names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| TaskError::InvalidId(s.to_string()))
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// TODO -> WORKING -> GREEN -> DEPLOYED
///  |         |   \-> RED
///  |         |    \-> SPLIT
///  |         \-> TODO (crash recovery)
///  \-> RED (unfinished breakdown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    Working,
    Green,
    Red,
    Split,
    Deployed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Todo,
        TaskStatus::Working,
        TaskStatus::Green,
        TaskStatus::Red,
        TaskStatus::Split,
        TaskStatus::Deployed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::Working => "WORKING",
            TaskStatus::Green => "GREEN",
            TaskStatus::Red => "RED",
            TaskStatus::Split => "SPLIT",
            TaskStatus::Deployed => "DEPLOYED",
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Red | TaskStatus::Split | TaskStatus::Deployed)
    }

    /// Counts as "done" for tasks that depend on this one.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Green | TaskStatus::Deployed)
    }

    /// Staying in the same status is always allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Todo, Working)
                    | (Todo, Red)
                    | (Working, Green)
                    | (Working, Red)
                    | (Working, Split)
                    | (Working, Todo)
                    | (Green, Deployed)
            )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| TaskError::InvalidStatus(s.to_string()))
    }
}

/// A unit of work with its own pass/fail oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    /// Executable check whose exit status decides pass/fail.
    pub verification_command: String,
    pub estimated_test_cases: u32,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TaskId>,
    /// Ids or descriptions of tasks that must be GREEN first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where the Verifier's tests for this task live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// Build a TODO task. Callers validate `new` first.
    pub(crate) fn from_new(new: NewTask, now: String) -> Self {
        Self {
            id: TaskId::new(),
            description: new.description.trim().to_string(),
            verification_command: new.verification_command.trim().to_string(),
            estimated_test_cases: new.estimated_test_cases,
            status: TaskStatus::Todo,
            branch: None,
            parent_id: new.parent_id,
            dependencies: new.dependencies,
            error: None,
            test_path: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Whether `dependency` names this task.
    pub fn is_named_by(&self, dependency: &str) -> bool {
        let dependency = dependency.trim();
        self.id.to_string() == dependency || self.description == dependency
    }

    /// Apply `update` in place, enforcing the status machine.
    ///
    /// # Errors
    /// [`TaskError::InvalidTransition`] when the status change is not allowed;
    /// the task is left untouched.
    pub fn apply(&mut self, update: TaskUpdate, now: String) -> Result<(), TaskError> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(TaskError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }
        if let Some(branch) = update.branch {
            self.branch = Some(branch);
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(test_path) = update.test_path {
            self.test_path = Some(test_path);
        }
        self.updated_at = now;
        Ok(())
    }
}

/// All dependencies of `task` that resolve to known tasks are satisfied.
/// References that match nothing are ignored.
pub fn dependencies_satisfied(task: &Task, all: &[Task]) -> bool {
    task.dependencies.iter().all(|dependency| {
        all.iter()
            .filter(|other| other.id != task.id && other.is_named_by(dependency))
            .all(|other| is_done(other, all))
    })
}

/// GREEN or DEPLOYED, or SPLIT with every child done.
fn is_done(task: &Task, all: &[Task]) -> bool {
    if task.status.satisfies_dependency() {
        return true;
    }
    if task.status != TaskStatus::Split {
        return false;
    }
    let mut children = all
        .iter()
        .filter(|child| child.parent_id == Some(task.id))
        .peekable();
    children.peek().is_some() && children.all(|child| is_done(child, all))
}

/// Oldest TODO task whose dependencies are satisfied. `all` must be in
/// creation order.
pub fn select_next_todo(all: &[Task]) -> Option<&Task> {
    all.iter()
        .filter(|task| task.status == TaskStatus::Todo)
        .find(|task| dependencies_satisfied(task, all))
}

/// A creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub description: String,
    pub verification_command: String,
    pub estimated_test_cases: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
}

impl NewTask {
    pub fn new(
        description: impl Into<String>,
        verification_command: impl Into<String>,
        estimated_test_cases: u32,
    ) -> Self {
        Self {
            description: description.into(),
            verification_command: verification_command.into(),
            estimated_test_cases,
            dependencies: Vec::new(),
            parent_id: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Enforce the verifiability bound and required fields.
    pub fn validate(&self, max_test_cases: u32) -> Result<(), TaskError> {
        if self.description.trim().is_empty() {
            return Err(TaskError::EmptyDescription);
        }
        if self.verification_command.trim().is_empty() {
            return Err(TaskError::EmptyVerificationCommand);
        }
        check_estimate(i64::from(self.estimated_test_cases), max_test_cases)
    }
}

/// `0 < estimate <= max_test_cases`.
pub fn check_estimate(estimate: i64, max_test_cases: u32) -> Result<(), TaskError> {
    if estimate < 1 || estimate > i64::from(max_test_cases) {
        return Err(TaskError::InvalidEstimate {
            estimate,
            max: max_test_cases,
        });
    }
    Ok(())
}

/// Partial update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub branch: Option<String>,
    /// `Some(None)` clears the error.
    pub error: Option<Option<String>>,
    pub test_path: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn with_test_path(mut self, test_path: impl Into<String>) -> Self {
        self.test_path = Some(test_path.into());
        self
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Task description cannot be empty")]
    EmptyDescription,

    #[error("Verification command cannot be empty")]
    EmptyVerificationCommand,

    #[error("estimated_test_cases must be between 1 and {max}, got {estimate}; split the task further")]
    InvalidEstimate { estimate: i64, max: u32 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid task id: {0}")]
    InvalidId(String),

    #[error("Invalid task status: {0}")]
    InvalidStatus(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(description: &str, status: TaskStatus, deps: &[&str]) -> Task {
        let mut t = Task::from_new(
            NewTask::new(description, "true", 1)
                .with_dependencies(deps.iter().map(|d| d.to_string()).collect()),
            "2026-01-01T00:00:00.000000Z".to_string(),
        );
        t.status = status;
        t
    }

    #[test]
    fn estimate_bound_is_inclusive() {
        assert!(NewTask::new("a", "true", 7).validate(7).is_ok());
        assert!(NewTask::new("a", "true", 1).validate(7).is_ok());
        assert!(matches!(
            NewTask::new("a", "true", 0).validate(7),
            Err(TaskError::InvalidEstimate { estimate: 0, max: 7 })
        ));
        assert!(matches!(
            NewTask::new("a", "true", 8).validate(7),
            Err(TaskError::InvalidEstimate { estimate: 8, .. })
        ));
        assert!(check_estimate(-2, 7).is_err());
    }

    #[test]
    fn blank_fields_are_rejected() {
        assert!(matches!(
            NewTask::new("  ", "true", 1).validate(7),
            Err(TaskError::EmptyDescription)
        ));
        assert!(matches!(
            NewTask::new("a", "", 1).validate(7),
            Err(TaskError::EmptyVerificationCommand)
        ));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!("green".parse::<TaskStatus>().unwrap(), TaskStatus::Green);
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn transitions_follow_state_machine() {
        use TaskStatus::*;
        assert!(Todo.can_transition_to(Working));
        assert!(Working.can_transition_to(Split));
        assert!(Working.can_transition_to(Todo));
        assert!(Green.can_transition_to(Deployed));
        assert!(Todo.can_transition_to(Red));
        assert!(!Todo.can_transition_to(Green));
        assert!(!Red.can_transition_to(Working));
        assert!(!Deployed.can_transition_to(Green));
    }

    #[test]
    fn apply_rejects_invalid_transition_without_mutating() {
        let mut t = task("a", TaskStatus::Todo, &[]);
        let err = t
            .apply(TaskUpdate::status(TaskStatus::Green).with_error("x"), "later".into())
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(t.status, TaskStatus::Todo);
        assert_eq!(t.error, None);

        t.apply(
            TaskUpdate::status(TaskStatus::Working).with_branch("twin/task-a"),
            "later".into(),
        )
        .unwrap();
        assert_eq!(t.branch.as_deref(), Some("twin/task-a"));
        assert_eq!(t.updated_at, "later");
    }

    #[test]
    fn next_todo_waits_for_dependencies() {
        let base = task("parse input", TaskStatus::Working, &[]);
        let dependent = task("format output", TaskStatus::Todo, &["parse input"]);
        let independent = task("log things", TaskStatus::Todo, &["no such task"]);
        let mut all = vec![base, dependent, independent];

        assert_eq!(select_next_todo(&all).unwrap().description, "log things");

        all[0].status = TaskStatus::Green;
        assert_eq!(select_next_todo(&all).unwrap().description, "format output");
    }

    #[test]
    fn split_dependency_waits_for_all_children() {
        let parent = task("parse and format", TaskStatus::Split, &[]);
        let mut first = task("parse", TaskStatus::Green, &[]);
        first.parent_id = Some(parent.id);
        let mut second = task("format", TaskStatus::Working, &[]);
        second.parent_id = Some(parent.id);
        let dependent = task("report", TaskStatus::Todo, &["parse and format"]);
        let mut all = vec![parent, first, second, dependent];

        assert!(select_next_todo(&all).is_none());

        all[2].status = TaskStatus::Deployed;
        assert_eq!(select_next_todo(&all).unwrap().description, "report");
    }

    #[test]
    fn nested_split_resolves_through_grandchildren() {
        let root = task("root", TaskStatus::Split, &[]);
        let mut middle = task("middle", TaskStatus::Split, &[]);
        middle.parent_id = Some(root.id);
        let mut leaf = task("leaf", TaskStatus::Red, &[]);
        leaf.parent_id = Some(middle.id);
        let dependent = task("after", TaskStatus::Todo, &["root"]);
        let mut all = vec![root, middle, leaf, dependent];

        assert!(select_next_todo(&all).is_none());

        all[2].status = TaskStatus::Green;
        assert_eq!(select_next_todo(&all).unwrap().description, "after");
    }

    #[test]
    fn split_without_children_stays_blocking() {
        let parent = task("lonely", TaskStatus::Split, &[]);
        let dependent = task("after", TaskStatus::Todo, &["lonely"]);
        assert!(select_next_todo(&[parent, dependent]).is_none());
    }

    #[test]
    fn dependencies_match_by_id() {
        let base = task("a", TaskStatus::Red, &[]);
        let id = base.id.to_string();
        let dependent = task("b", TaskStatus::Todo, &[id.as_str()]);
        let all = vec![base, dependent];
        assert!(select_next_todo(&all).is_none());
    }
}
