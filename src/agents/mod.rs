//! Agents module - the four roles and the loop that drives them.
//!
//! # Roles
//! - **Decomposer**: breaks a request into atomic, verifiable tasks (read-only)
//! - **Implementer**: writes and self-tests code for one task
//! - **Verifier**: authors independent tests, then inspects and approves/rejects
//! - **Integrator**: resolves merge conflicts during a deploy
//!
//! Every role is a [`Role`] strategy run by the same [`AgentRuntime`]; roles
//! differ only in their prompt, tool catalog and completion contract.

mod decomposer;
mod implementer;
mod integrator;
mod runtime;
mod types;
mod verifier;

pub use decomposer::Decomposer;
pub use implementer::{Implementer, RetryFeedback};
pub use integrator::Integrator;
pub use runtime::{AgentRuntime, CANCELLED, DEFAULT_MAX_ITERATIONS};
pub use types::{AgentRunResult, RoleKind, RunStatus, ToolResult};
pub use verifier::{Verifier, VerifierPhase};

use async_trait::async_trait;

use crate::llm::{ToolCall, ToolDefinition};

/// A role specialization of the agent loop.
///
/// # Contract
/// - `execute_tool` performs the call's side effects exactly once and never
///   panics; failures are returned as an unsuccessful [`ToolResult`]
/// - `handle_completion` returns `Some` only for a result that ends the run
#[async_trait]
pub trait Role: Send {
    fn kind(&self) -> RoleKind;

    fn system_prompt(&self) -> String;

    /// Catalog offered to the model on the next iteration.
    fn tools(&self) -> Vec<ToolDefinition>;

    async fn execute_tool(&mut self, call: &ToolCall) -> ToolResult;

    fn handle_completion(&mut self, result: &ToolResult) -> Option<AgentRunResult>;
}
