//! Integrator: resolves the conflicts of one in-progress merge.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AgentRunResult, Role, RoleKind, RunStatus, ToolResult};
use crate::llm::{ToolCall, ToolDefinition};
use crate::tools::{normalize_relative, required_str, tool_definition, ListFiles, ReadFile, ToolRegistry};
use crate::vcs::{has_conflict_markers, split_conflict, MergeSide, VersionControl};

pub struct Integrator {
    vcs: Arc<dyn VersionControl>,
    branch: String,
    conflicts: Vec<String>,
    resolved: BTreeSet<String>,
    tools: ToolRegistry,
}

impl Integrator {
    /// `branch` is being merged into mainline and left `conflicts` behind.
    pub fn new(vcs: Arc<dyn VersionControl>, branch: impl Into<String>, conflicts: Vec<String>) -> Self {
        Self {
            vcs,
            branch: branch.into(),
            conflicts,
            resolved: BTreeSet::new(),
            tools: ToolRegistry::empty().with(ReadFile).with(ListFiles),
        }
    }

    /// Every file resolved so far, for the deploy audit trail.
    pub fn resolved_files(&self) -> Vec<String> {
        self.resolved.iter().cloned().collect()
    }

    pub fn briefing(&self) -> String {
        format!(
            "Merging `{}` into `{}` produced conflicts in:\n{}",
            self.branch,
            self.vcs.mainline(),
            self.conflicts
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        )
    }

    fn relative(args: &Value) -> anyhow::Result<String> {
        let file = required_str(args, "file")?;
        Ok(normalize_relative(file)?.display().to_string())
    }

    async fn read_conflict(&self, args: &Value) -> anyhow::Result<String> {
        let file = Self::relative(args)?;
        let raw = tokio::fs::read_to_string(self.vcs.workdir().join(&file))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file, e))?;
        let sides = split_conflict(&raw);
        Ok(serde_json::to_string_pretty(&json!({
            "file": file,
            "hunks": sides.hunks,
            "ours": sides.ours,
            "theirs": sides.theirs,
            "base": sides.base,
            "raw": raw,
        }))?)
    }

    async fn resolve_conflict(&mut self, args: &Value) -> anyhow::Result<String> {
        let file = Self::relative(args)?;
        let content = required_str(args, "content")?;
        if has_conflict_markers(content) {
            anyhow::bail!("Content still contains conflict markers");
        }

        let full_path = self.vcs.workdir().join(&file);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, content).await?;
        self.vcs.stage(&[file.clone()]).await?;
        self.resolved.insert(file.clone());
        tracing::debug!("Integrator resolved {} by hand", file);
        Ok(format!("Resolved and staged {}", file))
    }

    async fn take_side(&mut self, args: &Value, side: MergeSide) -> anyhow::Result<String> {
        let file = Self::relative(args)?;
        self.vcs.checkout_side(&file, side).await?;
        self.resolved.insert(file.clone());
        tracing::debug!("Integrator took {:?} for {}", side, file);
        Ok(format!("Took {:?} version of {}", side, file))
    }

    async fn complete_resolution(&self, args: &Value) -> anyhow::Result<Value> {
        let remaining = self.vcs.unresolved_files().await?;
        if !remaining.is_empty() {
            anyhow::bail!("Unresolved files remain: {}", remaining.join(", "));
        }

        let summary = args["summary"].as_str().unwrap_or_default();
        let message = format!("Merge {} (conflicts resolved)\n\n{}", self.branch, summary);
        let commit = self.vcs.commit_merge(message.trim_end()).await?;
        Ok(json!({
            "summary": summary,
            "commit": commit,
            "resolved_files": self.resolved_files(),
        }))
    }
}

fn file_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "file": { "type": "string" } },
        "required": ["file"]
    })
}

#[async_trait]
impl Role for Integrator {
    fn kind(&self) -> RoleKind {
        RoleKind::Integrator
    }

    fn system_prompt(&self) -> String {
        r#"You are the Integrator. A merge into mainline stopped on conflicts; resolve every conflicted file.

## Policy
- Preserve the functionality of both sides.
- When genuinely ambiguous, prefer the incoming feature branch ("theirs"); it is more recent.
- Never remove existing passing tests.

Call complete_resolution once no conflicted file remains, or abort_resolution if the conflict cannot be resolved safely."#
            .to_string()
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        let mut tools = self.tools.get_tool_schemas();
        tools.push(tool_definition(
            "read_conflict",
            "Show both sides of a conflicted file plus the raw markers.",
            file_schema(),
        ));
        tools.push(tool_definition(
            "read_branch_version",
            "Read a file as committed on any branch, without touching the working tree.",
            json!({
                "type": "object",
                "properties": {
                    "branch": { "type": "string" },
                    "file": { "type": "string" }
                },
                "required": ["branch", "file"]
            }),
        ));
        tools.push(tool_definition(
            "resolve_conflict",
            "Write the hand-merged content of a file and stage it.",
            json!({
                "type": "object",
                "properties": {
                    "file": { "type": "string" },
                    "content": { "type": "string", "description": "Complete file content without markers" }
                },
                "required": ["file", "content"]
            }),
        ));
        tools.push(tool_definition("use_ours", "Keep the mainline version of a file.", file_schema()));
        tools.push(tool_definition(
            "use_theirs",
            "Take the feature-branch version of a file.",
            file_schema(),
        ));
        tools.push(tool_definition(
            "complete_resolution",
            "Commit the merge. Refused while conflicted files remain.",
            json!({
                "type": "object",
                "properties": { "summary": { "type": "string" } },
                "required": ["summary"]
            }),
        ));
        tools.push(tool_definition(
            "abort_resolution",
            "Discard the merge, leaving mainline untouched.",
            json!({
                "type": "object",
                "properties": { "reason": { "type": "string" } },
                "required": ["reason"]
            }),
        ));
        tools
    }

    async fn execute_tool(&mut self, call: &ToolCall) -> ToolResult {
        let name = call.function.name.as_str();
        let args = call.arguments();

        match name {
            "read_conflict" => ToolResult::from_tool(name, self.read_conflict(&args).await),
            "read_branch_version" => {
                let result = async {
                    let branch = required_str(&args, "branch")?;
                    let file = Self::relative(&args)?;
                    Ok::<_, anyhow::Error>(self.vcs.show_file_at(branch, &file).await?)
                }
                .await;
                ToolResult::from_tool(name, result)
            }
            "resolve_conflict" => ToolResult::from_tool(name, self.resolve_conflict(&args).await),
            "use_ours" => ToolResult::from_tool(name, self.take_side(&args, MergeSide::Ours).await),
            "use_theirs" => ToolResult::from_tool(name, self.take_side(&args, MergeSide::Theirs).await),
            "complete_resolution" => match self.complete_resolution(&args).await {
                Ok(data) => ToolResult::ok(name, "Merge committed").with_data(data),
                Err(e) => ToolResult::error(name, e),
            },
            "abort_resolution" => {
                let reason = args["reason"].as_str().unwrap_or("aborted").to_string();
                match self.vcs.abort_merge().await {
                    Ok(()) => ToolResult::ok(name, "Merge aborted").with_data(json!({
                        "reason": reason,
                        "resolved_files": self.resolved_files(),
                    })),
                    Err(e) => ToolResult::error(name, e),
                }
            }
            _ => ToolResult::from_tool(name, self.tools.execute(name, args, self.vcs.workdir()).await),
        }
    }

    fn handle_completion(&mut self, result: &ToolResult) -> Option<AgentRunResult> {
        if result.is_terminal("complete_resolution") {
            return Some(AgentRunResult::new(RunStatus::Resolved, result.data.clone()));
        }
        if result.is_terminal("abort_resolution") {
            let reason = result.data["reason"].as_str().unwrap_or("aborted").to_string();
            return Some(AgentRunResult::new(RunStatus::Aborted, result.data.clone()).with_error(reason));
        }
        None
    }
}
