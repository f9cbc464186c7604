//! twinspawn - command-line entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use twinspawn::llm::OpenRouterClient;
use twinspawn::{Config, GitRepo, Orchestrator, SqliteTaskStore, TaskRepository};

#[derive(Parser)]
#[command(
    name = "twinspawn",
    version,
    about = "Decompose, implement, verify and integrate work into a git mainline"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Break a request into TODO tasks.
    Decompose {
        /// Natural-language description of the work.
        request: String,
    },
    /// Take the next ready task through implement and verify.
    Tick,
    /// Recover interrupted tasks, then process every ready task.
    Run,
    /// Merge GREEN branches, run the integration suite, push or roll back.
    Deploy,
    /// Run then deploy on a fixed interval until interrupted.
    Serve,
    /// Print task counts and the latest deploy record as JSON.
    Status,
    /// Requeue tasks left WORKING by an interrupted process.
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twinspawn=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={}, workspace={}",
        config.default_model,
        config.workspace_path.display()
    );

    let cancel = CancellationToken::new();
    let orchestrator = build(config.clone(), cancel.clone()).await?;

    match cli.command {
        Command::Decompose { request } => print_json(&orchestrator.decompose(&request).await?)?,
        Command::Tick => match orchestrator.tick().await? {
            Some(outcome) => print_json(&outcome)?,
            None => info!("No ready TODO task"),
        },
        Command::Run => print_json(&orchestrator.run_all().await?)?,
        Command::Deploy => print_json(&orchestrator.deploy().await?)?,
        Command::Status => print_json(&orchestrator.status().await?)?,
        Command::Recover => print_json(&orchestrator.recover().await?)?,
        Command::Serve => serve(&orchestrator, &config, cancel).await?,
    }

    Ok(())
}

async fn build(config: Config, cancel: CancellationToken) -> anyhow::Result<Orchestrator> {
    let repo = SqliteTaskStore::open(config.database_path.clone(), config.max_test_cases)
        .await
        .with_context(|| format!("open task store {}", config.database_path.display()))?;
    info!(
        "Task store {} (persistent={})",
        config.database_path.display(),
        repo.is_persistent()
    );

    let mut vcs = GitRepo::new(
        &config.workspace_path,
        &config.mainline_branch,
        &config.remote_name,
    );
    if let Some((name, email)) = &config.commit_identity {
        vcs = vcs.with_identity(name, email);
    }

    let llm = OpenRouterClient::new(config.api_key.clone());

    Ok(Orchestrator::new(
        Arc::new(repo),
        Arc::new(vcs),
        Arc::new(llm),
        Arc::new(config),
    )
    .with_cancellation(cancel))
}

/// Alternate `run` and `deploy` until Ctrl-C.
async fn serve(orchestrator: &Orchestrator, config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; finishing the current step");
            stop.cancel();
        }
    });

    let mut interval = tokio::time::interval(config.deploy_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }

        match orchestrator.run_all().await {
            Ok(summary) => info!(
                "Processed {} task(s), {} blocked",
                summary.outcomes.len(),
                summary.blocked
            ),
            Err(e) => warn!("Run skipped: {}", e),
        }
        if cancel.is_cancelled() {
            break;
        }
        match orchestrator.deploy().await {
            Ok(record) => info!("Deploy {}", record.outcome.as_str()),
            Err(e) => warn!("Deploy skipped: {}", e),
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
