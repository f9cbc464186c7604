//! Verifier: independent tests first, inspection second.
//!
//! The two phases are enforced by the tool catalog, not by instructions:
//! while authoring, the only capabilities are writing under the test
//! directory, `finish_tests` and `reject`. Reading the implementation or
//! running anything becomes possible only after the tests are staged.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::decomposer::string_list;
use super::{AgentRunResult, Role, RoleKind, RunStatus, ToolResult};
use crate::llm::{ToolCall, ToolDefinition};
use crate::task::Task;
use crate::tools::{
    normalize_relative, required_str, run_sandboxed, tool_definition, truncate_output,
    CommandPolicy, FileInfo, ListFiles, ReadFile, RunCommand, SearchCode, ToolRegistry, WriteFile,
    WriteScope,
};
use crate::vcs::VersionControl;

const MAX_FAILURE_OUTPUT: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierPhase {
    /// Only test files may be written; nothing may be read or run.
    Authoring,
    /// Tests are staged; the implementation may be read and executed.
    Inspecting,
}

pub struct Verifier {
    vcs: Arc<dyn VersionControl>,
    task: Task,
    test_dir: PathBuf,
    policy: CommandPolicy,
    phase: VerifierPhase,
    authoring: ToolRegistry,
    inspecting: ToolRegistry,
    written: BTreeSet<String>,
    test_command: Option<String>,
}

impl Verifier {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        task: Task,
        test_dir: impl Into<PathBuf>,
        policy: CommandPolicy,
    ) -> Self {
        let test_dir = test_dir.into();
        let scope = WriteScope::Under(test_dir.clone());
        let policy = policy.with_write_scope(scope.clone());
        Self {
            vcs,
            task,
            authoring: ToolRegistry::empty().with(WriteFile::new(scope.clone())),
            inspecting: ToolRegistry::empty()
                .with(ReadFile)
                .with(ListFiles)
                .with(SearchCode)
                .with(FileInfo)
                .with(WriteFile::new(scope))
                .with(RunCommand::new(policy.clone())),
            test_dir,
            policy,
            phase: VerifierPhase::Authoring,
            written: BTreeSet::new(),
            test_command: None,
        }
    }

    pub fn phase(&self) -> VerifierPhase {
        self.phase
    }

    /// Opening message: the contract only, never the code.
    pub fn briefing(task: &Task, test_dir: &std::path::Path) -> String {
        format!(
            "## Task {}\n{}\n\n## Verification command\n`{}`\n\nDeclared test cases: {}\nWrite your tests under `{}/`.",
            task.id,
            task.description,
            task.verification_command,
            task.estimated_test_cases,
            test_dir.display()
        )
    }

    fn registry(&self) -> &ToolRegistry {
        match self.phase {
            VerifierPhase::Authoring => &self.authoring,
            VerifierPhase::Inspecting => &self.inspecting,
        }
    }

    fn test_path(&self) -> String {
        match self.written.iter().next() {
            Some(only) if self.written.len() == 1 => only.clone(),
            _ => self.test_dir.display().to_string(),
        }
    }

    async fn finish_tests(&mut self, args: &Value) -> anyhow::Result<String> {
        if self.phase == VerifierPhase::Inspecting {
            anyhow::bail!("Tests are already staged");
        }
        if self.written.is_empty() {
            anyhow::bail!("Write at least one test file under {}/ first", self.test_dir.display());
        }
        let test_command = required_str(args, "test_command")?;
        self.policy.check(test_command).map_err(|e| anyhow::anyhow!(e))?;

        let paths: Vec<String> = self.written.iter().cloned().collect();
        self.vcs.stage(&paths).await?;
        self.test_command = Some(test_command.to_string());
        self.phase = VerifierPhase::Inspecting;
        tracing::info!("Verifier staged {} test file(s) for task {}", paths.len(), self.task.id);

        Ok(format!(
            "Staged {} test file(s): {}. You may now read the implementation and run commands.",
            paths.len(),
            paths.join(", ")
        ))
    }

    async fn approve(&self, args: &Value) -> anyhow::Result<Value> {
        let Some(test_command) = self.test_command.as_deref() else {
            anyhow::bail!("approve is only available after finish_tests");
        };
        let tests_passed = args["tests_passed"]
            .as_u64()
            .filter(|n| *n > 0)
            .ok_or_else(|| anyhow::anyhow!("'tests_passed' must be a positive integer"))?;
        if tests_passed > u64::from(self.task.estimated_test_cases) {
            anyhow::bail!(
                "Full coverage took {} tests but the task declared {}; call reject instead",
                tests_passed,
                self.task.estimated_test_cases
            );
        }

        let workdir = self.vcs.workdir();
        let verification = run_sandboxed(&self.task.verification_command, workdir, self.policy.timeout).await?;
        if !verification.success() {
            anyhow::bail!(
                "Verification command failed; approval refused.\n{}",
                truncate_output(&verification.render(), MAX_FAILURE_OUTPUT)
            );
        }
        let tests = run_sandboxed(test_command, workdir, self.policy.timeout).await?;
        if !tests.success() {
            anyhow::bail!(
                "Your tests failed; approval refused.\n{}",
                truncate_output(&tests.render(), MAX_FAILURE_OUTPUT)
            );
        }

        Ok(json!({
            "tests_passed": tests_passed,
            "summary": args["summary"].as_str().unwrap_or_default(),
            "test_path": self.test_path(),
            "test_command": test_command,
        }))
    }
}

#[async_trait]
impl Role for Verifier {
    fn kind(&self) -> RoleKind {
        RoleKind::Verifier
    }

    fn system_prompt(&self) -> String {
        format!(
            r#"You are the Verifier. You decide whether a task is really done, independently of whoever implemented it.

## Phase 1: author tests
You see only the task description and its verification command. Write tests that fully cover the described behavior under `{dir}/`, then call finish_tests with the command that runs them.
If full coverage needs more test cases than the task declared, the task was mis-scoped: call reject.

## Phase 2: inspect
After finish_tests you may read the code and run commands. Run your tests.
- approve(tests_passed, summary): only when your tests and the verification command pass
- reject(reason, failed_tests): otherwise, with actionable feedback for the implementer"#,
            dir = self.test_dir.display()
        )
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        let mut tools = self.registry().get_tool_schemas();
        match self.phase {
            VerifierPhase::Authoring => tools.push(tool_definition(
                "finish_tests",
                "Stage the tests you wrote and unlock code inspection.",
                json!({
                    "type": "object",
                    "properties": {
                        "test_command": { "type": "string", "description": "Command that runs only your tests" }
                    },
                    "required": ["test_command"]
                }),
            )),
            VerifierPhase::Inspecting => tools.push(tool_definition(
                "approve",
                "Approve the task. Re-runs the verification command and your tests; refused unless both pass.",
                json!({
                    "type": "object",
                    "properties": {
                        "tests_passed": { "type": "integer", "minimum": 1 },
                        "summary": { "type": "string" }
                    },
                    "required": ["tests_passed", "summary"]
                }),
            )),
        }
        tools.push(tool_definition(
            "reject",
            "Reject the implementation with feedback.",
            json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" },
                    "failed_tests": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["reason"]
            }),
        ));
        tools
    }

    async fn execute_tool(&mut self, call: &ToolCall) -> ToolResult {
        let name = call.function.name.as_str();
        let args = call.arguments();

        match (name, self.phase) {
            ("reject", _) => match required_str(&args, "reason") {
                Ok(reason) => ToolResult::ok(name, "Rejected").with_data(json!({
                    "reason": reason,
                    "failed_tests": string_list(&args["failed_tests"]),
                })),
                Err(e) => ToolResult::error(name, e),
            },
            ("finish_tests", _) => ToolResult::from_tool(name, self.finish_tests(&args).await),
            ("approve", _) => match self.approve(&args).await {
                Ok(data) => ToolResult::ok(name, "Approved").with_data(data),
                Err(e) => ToolResult::error(name, e),
            },
            (_, phase) if !self.registry().has_tool(name) => {
                let hint = match phase {
                    VerifierPhase::Authoring => "; write your tests first and call finish_tests",
                    VerifierPhase::Inspecting => "",
                };
                ToolResult::error(name, format!("'{}' is not available{}", name, hint))
            }
            _ => {
                let result = self.registry().execute(name, args.clone(), self.vcs.workdir()).await;
                if name == "write_file" && result.is_ok() {
                    if let Some(path) = args["path"].as_str().and_then(|p| normalize_relative(p).ok()) {
                        self.written.insert(path.display().to_string());
                    }
                }
                ToolResult::from_tool(name, result)
            }
        }
    }

    fn handle_completion(&mut self, result: &ToolResult) -> Option<AgentRunResult> {
        if result.is_terminal("approve") {
            return Some(AgentRunResult::new(RunStatus::Approved, result.data.clone()));
        }
        if result.is_terminal("reject") {
            let reason = result.data["reason"].as_str().unwrap_or("rejected").to_string();
            return Some(AgentRunResult::new(RunStatus::Rejected, result.data.clone()).with_error(reason));
        }
        None
    }
}
