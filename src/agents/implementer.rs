//! Implementer: writes and self-tests the code for one task.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::decomposer::string_list;
use super::{AgentRunResult, Role, RoleKind, RunStatus, ToolResult};
use crate::llm::{ToolCall, ToolDefinition};
use crate::task::{check_estimate, NewTask, Task};
use crate::tools::{required_str, tool_definition, CommandPolicy, ToolRegistry, WriteScope};

/// What the Verifier said about the previous attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryFeedback {
    pub rejection_reason: String,
    pub failed_tests: Vec<String>,
}

impl RetryFeedback {
    pub fn from_result(result: &AgentRunResult) -> Self {
        Self {
            rejection_reason: result
                .error
                .clone()
                .or_else(|| result.result_str("reason").map(String::from))
                .unwrap_or_else(|| "rejected without a reason".to_string()),
            failed_tests: string_list(&result.result["failed_tests"]),
        }
    }
}

pub struct Implementer {
    task: Task,
    max_test_cases: u32,
    tools: ToolRegistry,
    workdir: PathBuf,
}

impl Implementer {
    pub fn new(task: Task, workdir: impl Into<PathBuf>, policy: CommandPolicy, max_test_cases: u32) -> Self {
        Self {
            task,
            max_test_cases,
            tools: ToolRegistry::workspace(WriteScope::Anywhere, policy),
            workdir: workdir.into(),
        }
    }

    /// Opening message for one attempt.
    pub fn briefing(task: &Task, feedback: Option<&RetryFeedback>) -> String {
        let mut message = format!(
            "## Task {}\n{}\n\n## Verification command\n`{}`\n\nExpected test cases: {}",
            task.id, task.description, task.verification_command, task.estimated_test_cases
        );
        if let Some(feedback) = feedback {
            message.push_str(&format!(
                "\n\n## Previous attempt was rejected\nReason: {}",
                feedback.rejection_reason
            ));
            if !feedback.failed_tests.is_empty() {
                message.push_str("\nFailed tests:");
                for test in &feedback.failed_tests {
                    message.push_str(&format!("\n- {}", test));
                }
            }
        }
        message
    }

    /// Validate a split declaration; every child must satisfy the bound.
    fn parse_split(&self, args: &Value) -> anyhow::Result<Vec<NewTask>> {
        let items = args["subtasks"]
            .as_array()
            .filter(|items| !items.is_empty())
            .ok_or_else(|| anyhow::anyhow!("'subtasks' must be a non-empty array"))?;

        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let estimate = item["estimated_test_cases"].as_i64().ok_or_else(|| {
                    anyhow::anyhow!("subtask {}: missing integer 'estimated_test_cases'", i + 1)
                })?;
                check_estimate(estimate, self.max_test_cases)
                    .map_err(|e| anyhow::anyhow!("subtask {}: {}", i + 1, e))?;
                let new = NewTask::new(
                    required_str(item, "description")?,
                    required_str(item, "verification_command")?,
                    estimate as u32,
                )
                .with_dependencies(string_list(&item["dependencies"]))
                .with_parent(self.task.id);
                new.validate(self.max_test_cases)
                    .map_err(|e| anyhow::anyhow!("subtask {}: {}", i + 1, e))?;
                Ok(new)
            })
            .collect()
    }
}

#[async_trait]
impl Role for Implementer {
    fn kind(&self) -> RoleKind {
        RoleKind::Implementer
    }

    fn system_prompt(&self) -> String {
        r#"You are the Implementer. Write the code for exactly one task and make its verification command pass.

## Workflow
1. Read the relevant code.
2. Write the implementation with write_file.
3. Run the verification command with run_command and fix failures.
4. Call task_complete when it passes.

## Terminal tools
- task_complete: the work is done and self-tested
- task_failed: the task cannot be done as specified (explain why)
- split_task: the task is really several tasks; declare them, each with its own verification command

An independent Verifier will test your work afterwards; do not write its tests for it."#
            .to_string()
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        let mut tools = self.tools.get_tool_schemas();
        tools.push(tool_definition(
            "task_complete",
            "Finish: the implementation is written and the verification command passes.",
            json!({
                "type": "object",
                "properties": { "summary": { "type": "string" } },
                "required": ["summary"]
            }),
        ));
        tools.push(tool_definition(
            "task_failed",
            "Finish: the task cannot be completed.",
            json!({
                "type": "object",
                "properties": { "reason": { "type": "string" } },
                "required": ["reason"]
            }),
        ));
        tools.push(tool_definition(
            "split_task",
            "Finish: replace this task with smaller subtasks.",
            json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" },
                    "subtasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "description": { "type": "string" },
                                "verification_command": { "type": "string" },
                                "estimated_test_cases": { "type": "integer", "minimum": 1, "maximum": self.max_test_cases },
                                "dependencies": { "type": "array", "items": { "type": "string" } }
                            },
                            "required": ["description", "verification_command", "estimated_test_cases"]
                        }
                    }
                },
                "required": ["reason", "subtasks"]
            }),
        ));
        tools
    }

    async fn execute_tool(&mut self, call: &ToolCall) -> ToolResult {
        let name = call.function.name.as_str();
        let args = call.arguments();

        match name {
            "task_complete" => {
                let summary = args["summary"].as_str().unwrap_or_default();
                ToolResult::ok(name, "Marked complete").with_data(json!({ "summary": summary }))
            }
            "task_failed" => match required_str(&args, "reason") {
                Ok(reason) => ToolResult::ok(name, "Marked failed").with_data(json!({ "reason": reason })),
                Err(e) => ToolResult::error(name, e),
            },
            "split_task" => match self.parse_split(&args) {
                Ok(subtasks) => ToolResult::ok(name, format!("Split into {} subtasks", subtasks.len()))
                    .with_data(json!({
                        "reason": args["reason"].as_str().unwrap_or_default(),
                        "subtasks": subtasks,
                    })),
                Err(e) => ToolResult::error(name, e),
            },
            _ => ToolResult::from_tool(name, self.tools.execute(name, args, &self.workdir).await),
        }
    }

    fn handle_completion(&mut self, result: &ToolResult) -> Option<AgentRunResult> {
        if result.is_terminal("task_complete") {
            return Some(AgentRunResult::new(RunStatus::Done, result.data.clone()));
        }
        if result.is_terminal("task_failed") {
            let reason = result.data["reason"].as_str().unwrap_or("failed").to_string();
            return Some(AgentRunResult::new(RunStatus::Failed, result.data.clone()).with_error(reason));
        }
        if result.is_terminal("split_task") {
            return Some(AgentRunResult::new(RunStatus::Split, result.data.clone()));
        }
        None
    }
}
