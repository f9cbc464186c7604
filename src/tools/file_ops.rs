//! File operation tools: read, write, file info.
//!
//! All paths are relative to the working tree; see [`super::resolve_scoped`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{normalize_relative, required_str, resolve_scoped, Tool};

const MAX_READ_CHARS: usize = 60_000;

/// Read the contents of a file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the working tree. Returns the content with line numbers."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the repository root"
                },
                "start_line": {
                    "type": "integer",
                    "description": "Optional: start reading from this line number (1-indexed)"
                },
                "end_line": {
                    "type": "integer",
                    "description": "Optional: stop reading at this line number (inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = required_str(&args, "path")?;
        let full_path = resolve_scoped(path, working_dir)?;

        if !full_path.is_file() {
            anyhow::bail!("File not found: {}", path);
        }

        let content = tokio::fs::read_to_string(&full_path).await?;
        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        let start = args["start_line"]
            .as_u64()
            .map(|n| (n as usize).saturating_sub(1))
            .unwrap_or(0)
            .min(total);
        let end = args["end_line"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(total)
            .clamp(start, total);

        if start >= total && total > 0 {
            return Ok(format!(
                "File has {} lines, requested start line {} is beyond end of file",
                total,
                start + 1
            ));
        }

        let mut numbered = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");

        if numbered.len() > MAX_READ_CHARS {
            numbered = super::truncate_output(&numbered, MAX_READ_CHARS);
        }

        Ok(numbered)
    }
}

/// Where a role may write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteScope {
    /// Anywhere in the working tree (outside `.git`).
    Anywhere,
    /// Only at or below this directory, relative to the tree root.
    Under(PathBuf),
}

impl WriteScope {
    /// Check a normalized relative path against the scope.
    pub fn permits(&self, relative: &Path) -> bool {
        match self {
            WriteScope::Anywhere => true,
            WriteScope::Under(dir) => relative.starts_with(dir) && relative != dir.as_path(),
        }
    }
}

/// Write content to a file (create or overwrite).
pub struct WriteFile {
    scope: WriteScope,
}

impl WriteFile {
    pub fn new(scope: WriteScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the working tree, creating parent directories. Overwrites existing files."
    }

    fn parameters_schema(&self) -> Value {
        let path_hint = match &self.scope {
            WriteScope::Anywhere => "Path relative to the repository root".to_string(),
            WriteScope::Under(dir) => format!("Path relative to the repository root, under {}", dir.display()),
        };
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": path_hint },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;

        let relative = normalize_relative(path)?;
        if !self.scope.permits(&relative) {
            if let WriteScope::Under(dir) = &self.scope {
                anyhow::bail!("Writes are restricted to {}/: {}", dir.display(), path);
            }
        }

        let full_path = working_dir.join(&relative);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, content).await?;

        Ok(format!("Wrote {} bytes to {}", content.len(), relative.display()))
    }
}

/// Size and line count for a file, without returning its content.
pub struct FileInfo;

#[async_trait]
impl Tool for FileInfo {
    fn name(&self) -> &str {
        "file_info"
    }

    fn description(&self) -> &str {
        "Report size, line count and the top-level declarations of a file without reading it in full."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the repository root" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let path = required_str(&args, "path")?;
        let full_path = resolve_scoped(path, working_dir)?;
        if !full_path.is_file() {
            anyhow::bail!("File not found: {}", path);
        }

        let content = tokio::fs::read_to_string(&full_path).await?;
        let declarations: Vec<&str> = content
            .lines()
            .filter(|line| is_declaration(line))
            .take(40)
            .collect();

        let mut out = format!(
            "{}: {} bytes, {} lines",
            path,
            content.len(),
            content.lines().count()
        );
        if !declarations.is_empty() {
            out.push_str("\nDeclarations:\n");
            out.push_str(&declarations.join("\n"));
        }
        Ok(out)
    }
}

fn is_declaration(line: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "pub fn ", "fn ", "pub struct ", "struct ", "pub enum ", "enum ", "pub trait ", "trait ",
        "impl ", "def ", "class ", "function ", "export ", "func ", "type ",
    ];
    PREFIXES.iter().any(|p| line.starts_with(p))
}
