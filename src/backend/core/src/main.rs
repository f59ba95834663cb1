//! Conductor - Main entry point
//!
//! Runs the task queue with command executors from the configuration,
//! optionally seeded from a plan file.

use clap::Parser;
use std::path::PathBuf;

use conductor_core::{
    config::Config,
    orchestrator::{load_plan, Orchestrator},
    telemetry::{self, TelemetryConfig},
};

#[derive(Debug, Parser)]
#[command(name = "conductor", version, about = "Dependency-aware task queue for agent orchestration")]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// JSON plan of tasks to submit after startup
    #[arg(short, long)]
    plan: Option<PathBuf>,

    /// Exit once the queue has nothing left to do
    #[arg(long)]
    exit_when_idle: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(&path.to_string_lossy())?,
        None => Config::load()?,
    };

    telemetry::init_telemetry(&TelemetryConfig::from(&config))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        "Starting Conductor"
    );

    let orchestrator = Orchestrator::from_config(config).await?;
    let report = orchestrator.start().await?;
    if report.recovered > 0 {
        tracing::info!(recovered = report.recovered, "Resumed interrupted tasks");
    }

    if let Some(path) = &cli.plan {
        let plan = load_plan(path).await?;
        let ids = orchestrator.submit_plan(&plan)?;
        tracing::info!(plan = %path.display(), tasks = ids.len(), "Plan submitted");
    }

    if cli.exit_when_idle {
        tokio::select! {
            _ = orchestrator.wait_idle() => tracing::info!("Queue is idle"),
            _ = shutdown_signal() => {},
        }
    } else {
        shutdown_signal().await;
    }

    orchestrator.shutdown().await?;

    let status = orchestrator.queue_status();
    tracing::info!(
        completed = status.completed,
        failed = status.failed,
        cancelled = status.cancelled,
        persistence_failures = status.persistence_failures,
        persistence_backlog = status.persistence_backlog,
        "Conductor shutdown complete"
    );

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
