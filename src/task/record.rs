//! Append-only deploy log entries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployOutcome {
    Success,
    Failed,
}

impl DeployOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployOutcome::Success => "SUCCESS",
            DeployOutcome::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(DeployOutcome::Success),
            "FAILED" => Some(DeployOutcome::Failed),
            _ => None,
        }
    }
}

/// A branch whose merge could not be completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedConflict {
    pub branch: String,
    pub files: Vec<String>,
    pub reason: String,
}

/// One Deploy Cycle invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    pub id: Uuid,
    /// Every GREEN branch the cycle tried to merge.
    pub attempted: Vec<String>,
    /// Branches merged into mainline (cleanly or by the Integrator).
    pub merged: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<UnresolvedConflict>,
    /// Files the Integrator resolved, for audit.
    #[serde(default)]
    pub resolved_files: Vec<String>,
    pub outcome: DeployOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
}

impl DeployRecord {
    pub fn new(outcome: DeployOutcome, created_at: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempted: Vec::new(),
            merged: Vec::new(),
            conflicts: Vec::new(),
            resolved_files: Vec::new(),
            outcome,
            commit_hash: None,
            error: None,
            created_at,
        }
    }
}
