//! Core types shared by every role.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::TokenUsage;

/// Which role an agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Decomposer,
    Implementer,
    Verifier,
    Integrator,
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoleKind::Decomposer => "decomposer",
            RoleKind::Implementer => "implementer",
            RoleKind::Verifier => "verifier",
            RoleKind::Integrator => "integrator",
        };
        f.write_str(name)
    }
}

/// Terminal label of a run. Which labels a role can produce:
///
/// | Role        | Labels                      |
/// |-------------|-----------------------------|
/// | Decomposer  | completed, rejected, failed |
/// | Implementer | done, split, failed         |
/// | Verifier    | approved, rejected, failed  |
/// | Integrator  | resolved, aborted, failed   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Done,
    Failed,
    Split,
    Approved,
    Rejected,
    Resolved,
    Aborted,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Split => "split",
            RunStatus::Approved => "approved",
            RunStatus::Rejected => "rejected",
            RunStatus::Resolved => "resolved",
            RunStatus::Aborted => "aborted",
            RunStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform return value of any role invocation.
///
/// # Invariants
/// - `status == Failed` implies `error.is_some()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub status: RunStatus,
    /// Role-specific payload (summary, subtasks, test path, commit hash...).
    pub result: Value,
    pub error: Option<String>,
    /// Gateway round trips consumed.
    pub iterations: usize,
    pub usage: TokenUsage,
}

impl AgentRunResult {
    pub fn new(status: RunStatus, result: Value) -> Self {
        Self {
            status,
            result,
            error: None,
            iterations: 0,
            usage: TokenUsage::default(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::new(RunStatus::Failed, Value::Null).with_error(error)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// String field of the payload, if present.
    pub fn result_str(&self, key: &str) -> Option<&str> {
        self.result.get(key).and_then(Value::as_str)
    }
}

/// Outcome of one tool invocation, as seen by the model and by the role.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub name: String,
    /// Text appended to the transcript.
    pub output: String,
    pub success: bool,
    /// Structured data for `handle_completion`; never shown to the model.
    pub data: Value,
}

impl ToolResult {
    pub fn ok(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            success: true,
            data: Value::Null,
        }
    }

    pub fn error(name: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            name: name.into(),
            output: format!("Error: {}", error),
            success: false,
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Convert a registry result, surfacing `Err` to the model as text.
    pub fn from_tool(name: impl Into<String>, result: anyhow::Result<String>) -> Self {
        match result {
            Ok(output) => Self::ok(name, output),
            Err(e) => Self::error(name, e),
        }
    }

    /// A successful call to the named terminal tool.
    pub fn is_terminal(&self, name: &str) -> bool {
        self.success && self.name == name
    }
}
