//! Configuration management for twinspawn.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. Your OpenRouter API key.
//! - `DEFAULT_MODEL` - Optional. Model used by every role. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `WORKSPACE_PATH` - Optional. The shared working tree. Defaults to current directory.
//! - `DATABASE_PATH` - Optional. SQLite task store. Defaults to `<workspace>/.twinspawn/state.db`.
//! - `MAX_ITERATIONS` - Optional. Agent loop ceiling. Defaults to `20`.
//! - `MAX_RETRIES` - Optional. Implementer retries after a rejection. Defaults to `3`.
//! - `MAX_TEST_CASES` - Optional. Verifiability bound per task. Defaults to `7`.
//! - `MAINLINE_BRANCH` - Optional. Defaults to `main`.
//! - `REMOTE_NAME` - Optional. Defaults to `origin`.
//! - `BRANCH_PREFIX` - Optional. Prefix for task branches. Defaults to `twin/`.
//! - `TEST_DIR` - Optional. Where the Verifier may write. Defaults to `tests/twin`.
//! - `INTEGRATION_TEST_COMMAND` - Optional. Full suite run by the deploy cycle. Defaults to `cargo test`.
//! - `COMMAND_TIMEOUT_SECS` - Optional. Defaults to `120`.
//! - `INTEGRATION_TIMEOUT_SECS` - Optional. Defaults to `1800`.
//! - `ALLOWED_COMMANDS` - Optional. Comma-separated executables agents may run.
//! - `DEPLOY_INTERVAL_SECS` - Optional. Period of `twinspawn serve`. Defaults to `600`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::tools::CommandPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "cargo", "rustc", "go", "npm", "npx", "node", "python", "python3", "pytest", "make", "ls",
    "cat", "grep", "find", "head", "tail", "wc", "echo", "true", "false", "test",
];

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// Model identifier (OpenRouter format) used by all roles
    pub default_model: String,

    /// The shared working tree (a git checkout)
    pub workspace_path: PathBuf,

    /// SQLite database holding tasks and deploy records
    pub database_path: PathBuf,

    /// Maximum iterations for the agent loop
    pub max_iterations: usize,

    /// Implementer retries after a Verifier rejection
    pub max_retries: usize,

    /// Upper bound on `estimated_test_cases`
    pub max_test_cases: u32,

    pub mainline_branch: String,

    pub remote_name: String,

    pub branch_prefix: String,

    /// Directory (relative to the workspace) the Verifier may write into
    pub test_dir: PathBuf,

    pub integration_test_command: String,

    pub command_timeout: Duration,

    pub integration_timeout: Duration,

    pub allowed_commands: Vec<String>,

    pub deploy_interval: Duration,

    /// Author for pipeline commits; falls back to the repository's git config
    pub commit_identity: Option<(String, String)>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let workspace_path = std::env::var("WORKSPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut config = Self::new(api_key, workspace_path);

        if let Ok(model) = std::env::var("DEFAULT_MODEL") {
            config.default_model = model;
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        config.max_iterations = parse_env("MAX_ITERATIONS", config.max_iterations)?;
        config.max_retries = parse_env("MAX_RETRIES", config.max_retries)?;
        config.max_test_cases = parse_env("MAX_TEST_CASES", config.max_test_cases)?;
        if config.max_test_cases == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_TEST_CASES".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if let Ok(branch) = std::env::var("MAINLINE_BRANCH") {
            config.mainline_branch = branch;
        }
        if let Ok(remote) = std::env::var("REMOTE_NAME") {
            config.remote_name = remote;
        }
        if let Ok(prefix) = std::env::var("BRANCH_PREFIX") {
            config.branch_prefix = prefix;
        }
        if let Ok(dir) = std::env::var("TEST_DIR") {
            config.test_dir = PathBuf::from(dir);
        }
        if let Ok(cmd) = std::env::var("INTEGRATION_TEST_COMMAND") {
            config.integration_test_command = cmd;
        }
        config.command_timeout =
            Duration::from_secs(parse_env("COMMAND_TIMEOUT_SECS", config.command_timeout.as_secs())?);
        config.integration_timeout = Duration::from_secs(parse_env(
            "INTEGRATION_TIMEOUT_SECS",
            config.integration_timeout.as_secs(),
        )?);
        config.deploy_interval =
            Duration::from_secs(parse_env("DEPLOY_INTERVAL_SECS", config.deploy_interval.as_secs())?);
        if let Ok(list) = std::env::var("ALLOWED_COMMANDS") {
            config.allowed_commands = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let (Ok(name), Ok(email)) = (
            std::env::var("COMMIT_AUTHOR_NAME"),
            std::env::var("COMMIT_AUTHOR_EMAIL"),
        ) {
            config.commit_identity = Some((name, email));
        }

        Ok(config)
    }

    /// Create a config with default values (useful for testing).
    pub fn new(api_key: String, workspace_path: PathBuf) -> Self {
        Self {
            api_key,
            default_model: "anthropic/claude-sonnet-4.5".to_string(),
            database_path: workspace_path.join(".twinspawn").join("state.db"),
            workspace_path,
            max_iterations: 20,
            max_retries: 3,
            max_test_cases: 7,
            mainline_branch: "main".to_string(),
            remote_name: "origin".to_string(),
            branch_prefix: "twin/".to_string(),
            test_dir: PathBuf::from("tests/twin"),
            integration_test_command: "cargo test".to_string(),
            command_timeout: Duration::from_secs(120),
            integration_timeout: Duration::from_secs(1800),
            allowed_commands: DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            deploy_interval: Duration::from_secs(600),
            commit_identity: None,
        }
    }

    /// Command allow-list and timeout handed to agents.
    pub fn command_policy(&self) -> CommandPolicy {
        CommandPolicy::new(self.allowed_commands.clone(), self.command_timeout)
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
