//! APIHUB Worker - Main entry point

use anyhow::Result;
use apihub_common::logging::{init_logging, LogConfig};
use apihub_worker::{Outcome, ProcessParser, Worker, WorkerApiClient, WorkerConfig};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lease builds from an APIHUB server and publish their results
#[derive(Parser, Debug)]
#[command(name = "apihub-worker", version, about)]
struct Args {
    /// APIHUB server URL
    #[arg(long, env = "APIHUB_SERVER_URL")]
    server_url: Option<String>,

    /// Identity reported when leasing builds
    #[arg(long, env = "APIHUB_BUILDER_ID")]
    builder_id: Option<String>,

    /// Shell command that turns a build source into a result
    #[arg(long, env = "WORKER_PARSER_COMMAND")]
    parser_command: Option<String>,

    /// Handle at most one build, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let log_config = LogConfig::for_service("apihub-worker").with_env()?;
    let _logging_guard = init_logging(&log_config)?;

    let mut config = WorkerConfig::from_env();
    if let Some(url) = args.server_url {
        config.server_url = url;
    }
    if let Some(id) = args.builder_id {
        config.builder_id = id;
    }
    if let Some(command) = args.parser_command {
        config.parser_command = command;
    }
    config.validate()?;

    info!(
        server_url = %config.server_url,
        builder_id = %config.builder_id,
        "Starting APIHUB Worker"
    );

    let client = Arc::new(WorkerApiClient::from_config(&config)?);
    if !client.health_check().await {
        tracing::warn!("Server health check failed, polling anyway");
    }
    let worker = Worker::new(client, ProcessParser::new(&config.parser_command), &config);

    if args.once {
        match worker.run_once().await? {
            Outcome::Idle => info!("No build was eligible"),
            outcome => info!(?outcome, "Build handled"),
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                return;
            }
            info!("Shutdown requested, finishing the current build");
            shutdown.cancel();
        });
    }

    worker.run(shutdown).await;
    Ok(())
}
