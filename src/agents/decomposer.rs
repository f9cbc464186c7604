//! Decomposer: turns a feature request into atomic TODO tasks.
//!
//! Read-only over the codebase. The only state it changes is the task
//! repository, through `create_subtask`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AgentRunResult, Role, RoleKind, RunStatus, ToolResult};
use crate::llm::{ToolCall, ToolDefinition};
use crate::task::{check_estimate, NewTask, TaskId, TaskRepository};
use crate::tools::{required_str, tool_definition, ToolRegistry};

/// Above this an `estimated_lines` hint is flagged, never enforced.
pub const SOFT_LINE_LIMIT: u64 = 300;

pub struct Decomposer {
    repo: Arc<dyn TaskRepository>,
    tools: ToolRegistry,
    workdir: PathBuf,
    created: Vec<TaskId>,
}

impl Decomposer {
    pub fn new(repo: Arc<dyn TaskRepository>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            tools: ToolRegistry::read_only(),
            workdir: workdir.into(),
            created: Vec::new(),
        }
    }

    /// Ids of every task persisted during this run, in creation order.
    pub fn created(&self) -> &[TaskId] {
        &self.created
    }

    async fn create_subtask(&mut self, args: &Value) -> anyhow::Result<(String, TaskId)> {
        let description = required_str(args, "description")?;
        let verification_command = required_str(args, "verification_command")?;
        let estimate = args["estimated_test_cases"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("Missing integer 'estimated_test_cases' argument"))?;
        check_estimate(estimate, self.repo.max_test_cases())?;

        let dependencies = string_list(&args["dependencies"]);
        let new = NewTask::new(description, verification_command, estimate as u32)
            .with_dependencies(dependencies);
        let task = self.repo.create(new).await?;
        self.created.push(task.id);
        tracing::info!("Decomposer created task {}: {}", task.id, task.description);

        let mut output = format!("Created task {} (status TODO)", task.id);
        if let Some(lines) = args["estimated_lines"].as_u64() {
            if lines > SOFT_LINE_LIMIT {
                tracing::warn!(
                    "Task {} estimates {} lines (soft limit {})",
                    task.id,
                    lines,
                    SOFT_LINE_LIMIT
                );
                output.push_str(&format!(
                    "\nWarning: estimated_lines {} exceeds the soft limit of {}; consider splitting further.",
                    lines, SOFT_LINE_LIMIT
                ));
            }
        }
        Ok((output, task.id))
    }
}

/// Array of strings from a JSON value; anything else is empty.
pub(crate) fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Role for Decomposer {
    fn kind(&self) -> RoleKind {
        RoleKind::Decomposer
    }

    fn system_prompt(&self) -> String {
        format!(
            r#"You are the Decomposer. Break the user's request into atomic tasks that can each be verified independently.

## Verifiability principle
Measure a task by the number of test cases needed to cover its behavior fully, not by its size.
Every task must need between 1 and {max} test cases. A task that needs more is several tasks: split it.

## Rules
- You cannot write code. Use the read-only tools to understand the codebase first.
- Each task needs a shell `verification_command` whose exit status decides pass/fail.
- List prerequisites in `dependencies` (ids returned by create_subtask, or exact descriptions).
- Call `complete_breakdown` once every task is created, or `reject_request` if the request cannot be decomposed."#,
            max = self.repo.max_test_cases()
        )
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        let max = self.repo.max_test_cases();
        let mut tools = self.tools.get_tool_schemas();
        tools.push(tool_definition(
            "create_subtask",
            "Persist one atomic task. Refused if estimated_test_cases is 0 or above the bound.",
            json!({
                "type": "object",
                "properties": {
                    "description": { "type": "string" },
                    "verification_command": { "type": "string", "description": "Shell command that exits 0 when the task is done" },
                    "estimated_test_cases": { "type": "integer", "minimum": 1, "maximum": max },
                    "dependencies": { "type": "array", "items": { "type": "string" } },
                    "estimated_lines": { "type": "integer", "description": "Optional size hint" }
                },
                "required": ["description", "verification_command", "estimated_test_cases"]
            }),
        ));
        tools.push(tool_definition(
            "reject_request",
            "Give up: the request cannot be decomposed into verifiable tasks.",
            json!({
                "type": "object",
                "properties": { "reason": { "type": "string" } },
                "required": ["reason"]
            }),
        ));
        tools.push(tool_definition(
            "complete_breakdown",
            "Finish decomposition after all tasks are created.",
            json!({
                "type": "object",
                "properties": {
                    "summary": { "type": "string" },
                    "total_tasks": { "type": "integer" }
                },
                "required": ["summary", "total_tasks"]
            }),
        ));
        tools
    }

    async fn execute_tool(&mut self, call: &ToolCall) -> ToolResult {
        let name = call.function.name.as_str();
        let args = call.arguments();

        match name {
            "create_subtask" => match self.create_subtask(&args).await {
                Ok((output, id)) => ToolResult::ok(name, output).with_data(json!({ "task_id": id })),
                Err(e) => ToolResult::error(name, e),
            },
            "reject_request" => match required_str(&args, "reason") {
                Ok(reason) => ToolResult::ok(name, "Request rejected").with_data(json!({ "reason": reason })),
                Err(e) => ToolResult::error(name, e),
            },
            "complete_breakdown" => {
                if self.created.is_empty() {
                    return ToolResult::error(
                        name,
                        "No tasks were created. Create at least one task or call reject_request.",
                    );
                }
                let summary = args["summary"].as_str().unwrap_or_default();
                if let Some(declared) = args["total_tasks"].as_u64() {
                    if declared as usize != self.created.len() {
                        tracing::warn!(
                            "Decomposer declared {} tasks but created {}",
                            declared,
                            self.created.len()
                        );
                    }
                }
                ToolResult::ok(name, "Breakdown complete").with_data(json!({
                    "summary": summary,
                    "total_tasks": self.created.len(),
                    "task_ids": self.created,
                }))
            }
            _ => ToolResult::from_tool(name, self.tools.execute(name, args, &self.workdir).await),
        }
    }

    fn handle_completion(&mut self, result: &ToolResult) -> Option<AgentRunResult> {
        if result.is_terminal("complete_breakdown") {
            return Some(AgentRunResult::new(RunStatus::Completed, result.data.clone()));
        }
        if result.is_terminal("reject_request") {
            let reason = result.data["reason"].as_str().unwrap_or("rejected").to_string();
            return Some(AgentRunResult::new(RunStatus::Rejected, result.data.clone()).with_error(reason));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRuntime;
    use crate::task::{InMemoryTaskStore, TaskStatus};
    use crate::test_support::{tool_reply, ScriptedLlm};

    fn subtask(estimate: i64) -> Value {
        json!({
            "description": format!("task with {} cases", estimate),
            "verification_command": "cargo test",
            "estimated_test_cases": estimate
        })
    }

    #[tokio::test]
    async fn out_of_bound_estimates_are_refused_and_not_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Arc::new(InMemoryTaskStore::new(7));
        let llm = ScriptedLlm::new(vec![
            tool_reply(vec![
                ("1", "create_subtask", subtask(0)),
                ("2", "create_subtask", subtask(8)),
                ("3", "create_subtask", subtask(-1)),
                ("4", "create_subtask", subtask(7)),
            ]),
            tool_reply(vec![("5", "complete_breakdown", json!({"summary": "one task", "total_tasks": 1}))]),
        ]);

        let mut decomposer = Decomposer::new(repo.clone(), dir.path());
        let result = AgentRuntime::new(Arc::new(llm), "m")
            .run(&mut decomposer, "build it")
            .await;

        assert_eq!(result.status, RunStatus::Completed);
        let tasks = repo.all().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].estimated_test_cases, 7);
        assert_eq!(tasks[0].status, TaskStatus::Todo);
        assert_eq!(decomposer.created(), &[tasks[0].id]);
        assert_eq!(result.result["task_ids"][0], json!(tasks[0].id));
    }

    #[tokio::test]
    async fn completing_without_tasks_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Arc::new(InMemoryTaskStore::new(7));
        let mut decomposer = Decomposer::new(repo, dir.path());

        let result = decomposer
            .execute_tool(&ToolCall::new("1", "complete_breakdown", json!({"summary": "", "total_tasks": 0})))
            .await;
        assert!(!result.success);
        assert!(decomposer.handle_completion(&result).is_none());
    }

    #[tokio::test]
    async fn reject_request_is_terminal_with_reason() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Arc::new(InMemoryTaskStore::new(7));
        let mut decomposer = Decomposer::new(repo, dir.path());

        let result = decomposer
            .execute_tool(&ToolCall::new("1", "reject_request", json!({"reason": "too vague"})))
            .await;
        let done = decomposer.handle_completion(&result).unwrap();
        assert_eq!(done.status, RunStatus::Rejected);
        assert_eq!(done.error.as_deref(), Some("too vague"));
    }

    #[tokio::test]
    async fn large_line_estimate_only_warns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Arc::new(InMemoryTaskStore::new(7));
        let mut decomposer = Decomposer::new(repo.clone(), dir.path());

        let mut args = subtask(3);
        args["estimated_lines"] = json!(900);
        args["dependencies"] = json!(["parse config", 42]);
        let result = decomposer
            .execute_tool(&ToolCall::new("1", "create_subtask", args))
            .await;

        assert!(result.success);
        assert!(result.output.contains("soft limit"));
        let task = &repo.all().await.unwrap()[0];
        assert_eq!(task.dependencies, vec!["parse config".to_string()]);
    }

    #[tokio::test]
    async fn write_tools_are_not_offered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let decomposer = Decomposer::new(Arc::new(InMemoryTaskStore::new(7)), dir.path());
        let names: Vec<String> = decomposer.tools().into_iter().map(|t| t.function.name).collect();
        assert!(!names.iter().any(|n| n == "write_file" || n == "run_command"));
        assert!(names.iter().any(|n| n == "search_code"));

        let mut decomposer = decomposer;
        let result = decomposer
            .execute_tool(&ToolCall::new("1", "write_file", json!({"path": "a", "content": "b"})))
            .await;
        assert!(!result.success);
        assert!(!dir.path().join("a").exists());
    }
}
