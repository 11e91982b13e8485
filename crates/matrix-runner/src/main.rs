//! Matrix Runner binary.
//!
//! Runs a plan from a JSON file and reads operator commands from stdin.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use matrix_engine::{
    Engine, EngineConfig, FailoverDecision, JsonFileSnapshotStore, JsonLinesReportSink, RunHandle,
    RunPlan, SnapshotStore,
};

#[derive(Parser)]
#[command(name = "matrix-runner")]
#[command(version, about = "Matrix Engine plan runner", long_about = None)]
struct Cli {
    /// Plan file (JSON)
    #[arg(value_name = "PLAN")]
    plan: Option<PathBuf>,

    /// Snapshot file written when the run ends
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Resume from the snapshot file instead of loading a plan
    #[arg(short, long, requires = "snapshot")]
    resume: bool,

    /// Report directory (overrides MATRIX_ENGINE_REPORTS_DIR)
    #[arg(long)]
    reports: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

const COMMANDS: &str = "continue | replay | pause | restart | skip | ignore-all | status | interrupt";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,matrix_engine=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // Load environment variables
    dotenvy::dotenv().ok();

    let mut config = EngineConfig::from_env()?;
    if let Some(dir) = cli.reports.clone() {
        config.reports_dir = dir;
    }
    tracing::info!(
        reports_dir = %config.reports_dir.display(),
        max_async_workers = config.max_async_workers,
        "Engine configuration loaded"
    );

    let store = cli.snapshot.clone().map(JsonFileSnapshotStore::new);
    let plan = match (&store, cli.resume) {
        (Some(store), true) => {
            let snapshot = store
                .load()
                .await?
                .with_context(|| format!("No snapshot at {}", store.path().display()))?;
            RunPlan::from_snapshot(snapshot)
        }
        _ => {
            let path = cli
                .plan
                .as_ref()
                .context("A plan file is required unless --resume is given")?;
            RunPlan::from_json_file(path)
                .with_context(|| format!("Failed to load plan {}", path.display()))?
        }
    };

    let engine = Engine::new(config).with_report_sink(Arc::new(JsonLinesReportSink::new()));
    let handle = engine.start(plan)?;
    tracing::info!("Run started, commands: {}", COMMANDS);

    wait_for_end(&handle).await;
    let run = handle.join().await?;

    for script in &run.scripts {
        tracing::info!(
            script = %script.name,
            executed = script.executed(),
            successful = script.successful(),
            passed = script.is_successful(),
            "Script finished"
        );
    }
    tracing::info!(state = %run.state, passed = run.is_successful(), "Run finished");

    if let Some(store) = &store {
        store.save(&run.snapshot()).await?;
    }

    Ok(if run.is_successful() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Serve operator commands and signals until the run reaches a terminal state.
async fn wait_for_end(handle: &RunHandle) {
    let finished = handle.wait_for_state(|s| s.is_terminal());
    let signal = shutdown_signal();
    let commands = operator_commands(handle);
    tokio::pin!(finished, signal, commands);

    let mut interrupted = false;
    let mut commands_open = true;
    loop {
        tokio::select! {
            _ = &mut finished => break,
            _ = &mut signal, if !interrupted => {
                tracing::info!("Shutdown signal received");
                handle.interrupt();
                interrupted = true;
            }
            _ = &mut commands, if commands_open => {
                tracing::debug!("Operator input closed");
                commands_open = false;
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
}

/// Apply one command per stdin line. Returns when stdin is closed.
async fn operator_commands(handle: &RunHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read operator input");
                return;
            }
        };
        match line.trim() {
            "" => {}
            "continue" | "c" => handle.continue_execution(),
            "replay" | "r" => handle.replay_step(),
            "pause" | "p" => handle.pause(),
            "restart" => handle.resolve_failover(FailoverDecision::Restart),
            "skip" => handle.resolve_failover(FailoverDecision::Skip),
            "ignore-all" => handle.ignore_all_failovers(true),
            "status" | "s" => match serde_json::to_string_pretty(&handle.status()) {
                Ok(status) => println!("{}", status),
                Err(e) => tracing::warn!(error = %e, "Failed to render status"),
            },
            "interrupt" | "q" => handle.interrupt(),
            other => tracing::warn!(command = %other, "Unknown command, expected one of: {}", COMMANDS),
        }
    }
}
