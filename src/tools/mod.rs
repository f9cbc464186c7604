//! Tool system for the role agents.
//!
//! Tools are the agents' only way to touch the working tree. Each role gets
//! its own [`ToolRegistry`] holding exactly the capabilities it is allowed:
//! the Decomposer is read-only, the Verifier may only write under the test
//! directory, the Implementer may write anywhere in the tree.
//!
//! ## Scoped paths
//!
//! Every path an agent supplies is interpreted relative to the working tree.
//! Absolute paths, `..` escapes and anything inside `.git` are refused.

mod directory;
mod file_ops;
mod search;
mod terminal;

pub use directory::ListFiles;
pub use file_ops::{FileInfo, ReadFile, WriteFile, WriteScope};
pub use search::{CodebaseSummary, SearchCode};
pub use terminal::{run_sandboxed, truncate_output, CommandOutput, CommandPolicy, RunCommand};

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{FunctionDefinition, ToolDefinition};

/// Resolve an agent-supplied path inside `working_dir`.
///
/// # Errors
/// Absolute paths, paths that climb above the root, and paths into `.git`.
pub fn resolve_scoped(path_str: &str, working_dir: &Path) -> anyhow::Result<PathBuf> {
    let relative = normalize_relative(path_str)?;
    Ok(working_dir.join(relative))
}

/// Lexically normalize a relative path, refusing anything that leaves the tree.
pub fn normalize_relative(path_str: &str) -> anyhow::Result<PathBuf> {
    let path = Path::new(path_str.trim());
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    anyhow::bail!("Path escapes the working tree: {}", path_str);
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("Absolute paths are not allowed: {}", path_str);
            }
        }
    }

    if out.components().next().map(|c| c.as_os_str() == ".git").unwrap_or(false) {
        anyhow::bail!("The .git directory is off limits: {}", path_str);
    }

    Ok(out)
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// Relative paths in `args` resolve against `working_dir`.
    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String>;
}

/// Registry of the tools one role may use.
///
/// Ordered by name so the catalog sent to the model is stable across calls.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any tool of the same name.
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    /// Read-only codebase inspection: summary, search, file info, read, list.
    pub fn read_only() -> Self {
        Self::empty()
            .with(CodebaseSummary)
            .with(SearchCode)
            .with(FileInfo)
            .with(ReadFile)
            .with(ListFiles)
    }

    /// Read, list, write within `scope`, and run allow-listed commands.
    pub fn workspace(scope: WriteScope, policy: CommandPolicy) -> Self {
        Self::empty()
            .with(ReadFile)
            .with(ListFiles)
            .with(SearchCode)
            .with(WriteFile::new(scope))
            .with(RunCommand::new(policy))
    }

    /// Check if a tool exists by name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get tool schemas in LLM-compatible format.
    pub fn get_tool_schemas(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters_schema(),
                },
            })
            .collect()
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;

        tool.execute(args, working_dir).await
    }
}

/// Definition for a tool handled by the role itself rather than the registry.
pub fn tool_definition(name: &str, description: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

/// Pull a required string argument out of a tool call.
pub fn required_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing '{}' argument", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_paths_inside_tree() {
        assert_eq!(normalize_relative("src/./lib.rs").unwrap(), PathBuf::from("src/lib.rs"));
        assert_eq!(normalize_relative("src/../README.md").unwrap(), PathBuf::from("README.md"));
    }

    #[test]
    fn normalize_rejects_escapes() {
        assert!(normalize_relative("../outside").is_err());
        assert!(normalize_relative("/etc/passwd").is_err());
        assert!(normalize_relative("src/../../x").is_err());
        assert!(normalize_relative(".git/config").is_err());
        assert!(normalize_relative("./.git/HEAD").is_err());
    }

    #[test]
    fn read_only_registry_has_no_writers() {
        let registry = ToolRegistry::read_only();
        assert!(registry.has_tool("read_file"));
        assert!(registry.has_tool("search_code"));
        assert!(!registry.has_tool("write_file"));
        assert!(!registry.has_tool("run_command"));
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let registry = ToolRegistry::workspace(WriteScope::Anywhere, CommandPolicy::default());
        let names: Vec<String> = registry
            .get_tool_schemas()
            .into_iter()
            .map(|d| d.function.name)
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::empty();
        let err = registry
            .execute("nope", Value::Null, Path::new("."))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }
}
