//! Read-only codebase inspection used during planning: regex search and a
//! shape summary of the tree.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use super::directory::is_skipped;
use super::{required_str, resolve_scoped, Tool};

const MAX_MATCHES: usize = 100;
const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Regex search over file contents.
pub struct SearchCode;

#[async_trait]
impl Tool for SearchCode {
    fn name(&self) -> &str {
        "search_code"
    }

    fn description(&self) -> &str {
        "Search file contents in the working tree with a regular expression. Returns path:line: text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression" },
                "path": { "type": "string", "description": "Directory to search (default: '.')" }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let pattern = required_str(&args, "pattern")?;
        let regex = Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid pattern: {}", e))?;
        let root = resolve_scoped(args["path"].as_str().unwrap_or("."), working_dir)?;
        let working_dir = working_dir.to_path_buf();

        let matches = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            let walker = WalkDir::new(&root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !is_skipped(e));

            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let relative = entry
                    .path()
                    .strip_prefix(&working_dir)
                    .unwrap_or(entry.path())
                    .display()
                    .to_string();
                for (i, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        matches.push(format!("{}:{}: {}", relative, i + 1, line.trim()));
                        if matches.len() >= MAX_MATCHES {
                            return matches;
                        }
                    }
                }
            }
            matches
        })
        .await?;

        if matches.is_empty() {
            Ok("No matches".to_string())
        } else {
            Ok(matches.join("\n"))
        }
    }
}

/// Counts of files and lines per extension plus the top-level layout.
pub struct CodebaseSummary;

#[async_trait]
impl Tool for CodebaseSummary {
    fn name(&self) -> &str {
        "codebase_summary"
    }

    fn description(&self) -> &str {
        "Summarize the repository: top-level entries and file/line counts per file extension."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let root = working_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let mut top_level = Vec::new();
            let mut by_ext: BTreeMap<String, (usize, usize)> = BTreeMap::new();

            let walker = WalkDir::new(&root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !is_skipped(e));

            for entry in walker.filter_map(|e| e.ok()) {
                if entry.depth() == 1 {
                    let suffix = if entry.file_type().is_dir() { "/" } else { "" };
                    top_level.push(format!("{}{}", entry.file_name().to_string_lossy(), suffix));
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                let ext = entry
                    .path()
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_else(|| "(none)".to_string());
                let lines = std::fs::read_to_string(entry.path())
                    .map(|c| c.lines().count())
                    .unwrap_or(0);
                let slot = by_ext.entry(ext).or_default();
                slot.0 += 1;
                slot.1 += lines;
            }

            let mut out = format!("Top level: {}\n", top_level.join(", "));
            out.push_str("Files by extension:\n");
            for (ext, (files, lines)) in by_ext {
                out.push_str(&format!("  .{}: {} files, {} lines\n", ext, files, lines));
            }
            Ok(out)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn add(a: i32) {}\nfn sub() {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# add things\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn search_reports_relative_locations() {
        let dir = fixture();
        let out = SearchCode
            .execute(json!({"pattern": "fn \\w+"}), dir.path())
            .await
            .unwrap();
        assert!(out.contains("src/lib.rs:1: pub fn add(a: i32) {}"));
        assert!(out.contains("src/lib.rs:2: fn sub() {}"));
        assert!(!out.contains("README"));
    }

    #[tokio::test]
    async fn search_rejects_bad_regex() {
        let dir = fixture();
        let err = SearchCode
            .execute(json!({"pattern": "("}), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid pattern"));
    }

    #[tokio::test]
    async fn summary_counts_by_extension() {
        let dir = fixture();
        let out = CodebaseSummary.execute(json!({}), dir.path()).await.unwrap();
        assert!(out.contains("Top level: README.md, src/"));
        assert!(out.contains(".rs: 1 files, 2 lines"));
        assert!(out.contains(".md: 1 files, 1 lines"));
    }
}
