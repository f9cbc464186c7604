//! Sandboxed command execution.
//!
//! Commands run through `/bin/sh -c` in the working tree with a hard
//! wall-clock limit. Agent-issued commands must additionally pass a
//! [`CommandPolicy`]: only allow-listed executables, no command substitution,
//! no output redirection outside the role's write scope, and no `find`
//! actions that run or delete on their own.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{normalize_relative, required_str, Tool, WriteScope};
use crate::config::DEFAULT_ALLOWED_COMMANDS;

const MAX_TOOL_OUTPUT_CHARS: usize = 10_000;

/// `find` primaries that execute programs or write and delete files.
const FIND_ACTIONS: &[&str] = &[
    "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprint0", "-fprintf", "-fls",
];

/// Sanitize command output to be safe for LLM consumption.
/// Removes binary garbage while preserving valid text.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n... [output truncated]");
    out
}

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Render for a model or a deploy record.
    pub fn render(&self) -> String {
        let mut result = format!("Exit code: {}\n", self.exit_code);
        if !self.stdout.is_empty() {
            result.push_str("\n--- stdout ---\n");
            result.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            result.push_str("\n--- stderr ---\n");
            result.push_str(&self.stderr);
        }
        result
    }
}

/// Run `command` in `cwd`, killing it once `timeout` elapses.
///
/// # Errors
/// Spawn failures and timeouts.
pub async fn run_sandboxed(command: &str, cwd: &Path, timeout: Duration) -> anyhow::Result<CommandOutput> {
    tracing::debug!("Executing command in {:?}: {}", cwd, command);

    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("Failed to execute command: {}", e))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => anyhow::bail!("Failed to execute command: {}", e),
        Err(_) => {
            tracing::warn!("Command timed out after {:?}: {}", timeout, command);
            anyhow::bail!("Command timed out after {} seconds", timeout.as_secs());
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: sanitize_output(&output.stdout),
        stderr: sanitize_output(&output.stderr),
    })
}

/// Which executables agents may invoke, and for how long.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: Vec<String>,
    scope: WriteScope,
    pub timeout: Duration,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(120),
        )
    }
}

impl CommandPolicy {
    pub fn new(allowed: Vec<String>, timeout: Duration) -> Self {
        Self {
            allowed,
            scope: WriteScope::Anywhere,
            timeout,
        }
    }

    /// Restrict redirection targets to `scope`.
    pub fn with_write_scope(mut self, scope: WriteScope) -> Self {
        self.scope = scope;
        self
    }

    /// Validate every segment of a (possibly chained) shell command.
    pub fn check(&self, command: &str) -> Result<(), String> {
        if command.contains('`') || command.contains("$(") {
            return Err("Command substitution is not allowed".to_string());
        }

        for target in redirect_targets(command) {
            self.check_redirect(&target)?;
        }

        // `2>&1` is a redirection, not a background separator.
        let normalized = command.replace(">&", ">");
        let segments = normalized.split(|c| c == ';' || c == '|' || c == '&' || c == '\n');

        let mut saw_command = false;
        for segment in segments {
            let Some(program) = first_program(segment) else {
                continue;
            };
            saw_command = true;
            let base = program.rsplit('/').next().unwrap_or(program);
            if !self.allowed.iter().any(|a| a == base) {
                return Err(format!(
                    "'{}' is not an allowed command. Allowed: {}",
                    base,
                    self.allowed.join(", ")
                ));
            }
            if base == "find" {
                if let Some(action) = segment.split_whitespace().find(|w| FIND_ACTIONS.contains(w)) {
                    return Err(format!("find {} is not allowed", action));
                }
            }
        }

        if saw_command {
            Ok(())
        } else {
            Err("Empty command".to_string())
        }
    }

    fn check_redirect(&self, target: &str) -> Result<(), String> {
        if target == "/dev/null" {
            return Ok(());
        }
        let relative = normalize_relative(target).map_err(|e| format!("Redirection refused: {}", e))?;
        if relative.as_os_str().is_empty() || !self.scope.permits(&relative) {
            return Err(format!("Redirection to '{}' is outside the writable area", target));
        }
        Ok(())
    }
}

/// Targets of unquoted output redirections (`>`, `>>`, `>|`, `&>`),
/// skipping descriptor duplication such as `2>&1`.
fn redirect_targets(command: &str) -> Vec<String> {
    let chars: Vec<char> = command.chars().collect();
    let mut targets = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\\' => i += 1,
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '>' => {
                if matches!(chars.get(i).copied(), Some('>' | '|')) {
                    i += 1;
                }
                let duplicates = chars.get(i) == Some(&'&');
                if duplicates {
                    i += 1;
                }
                let (word, next) = shell_word(&chars, i);
                i = next;
                let is_descriptor = !word.is_empty() && (word == "-" || word.chars().all(|d| d.is_ascii_digit()));
                if !(duplicates && is_descriptor) {
                    targets.push(word);
                }
            }
            None => {}
        }
    }
    targets
}

/// Read one shell word starting at `start`, dropping quotes.
fn shell_word(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    while chars.get(i).is_some_and(|c| c.is_whitespace() && *c != '\n') {
        i += 1;
    }
    let mut word = String::new();
    let mut quote: Option<char> = None;
    while let Some(&c) = chars.get(i) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => word.push(c),
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() || ";|&<>()".contains(c) => break,
            None => word.push(c),
        }
        i += 1;
    }
    (word, i)
}

/// First word of a command segment, skipping `VAR=value` prefixes.
fn first_program(segment: &str) -> Option<&str> {
    segment
        .split_whitespace()
        .find(|word| !(word.contains('=') && !word.starts_with('=')))
}

/// Run an allow-listed shell command in the working tree.
pub struct RunCommand {
    policy: CommandPolicy,
}

impl RunCommand {
    pub fn new(policy: CommandPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the repository root (tests, builds). Only allow-listed executables are permitted; a timeout counts as failure."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute, e.g. 'cargo test add_'"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Optional lower timeout in seconds; never exceeds the configured limit"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, working_dir: &Path) -> anyhow::Result<String> {
        let command = required_str(&args, "command")?;

        if let Err(msg) = self.policy.check(command) {
            tracing::warn!("Blocked command: {} ({})", command, msg);
            anyhow::bail!("{}", msg);
        }

        let timeout = args["timeout_secs"]
            .as_u64()
            .map(|secs| Duration::from_secs(secs.max(1)).min(self.policy.timeout))
            .unwrap_or(self.policy.timeout);

        let output = run_sandboxed(command, working_dir, timeout).await?;
        Ok(truncate_output(&output.render(), MAX_TOOL_OUTPUT_CHARS))
    }
}
