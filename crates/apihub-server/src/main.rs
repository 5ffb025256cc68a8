//! APIHUB Server - Main entry point

use anyhow::Result;
use apihub_common::logging::{init_logging, LogConfig};
use std::{net::SocketAddr, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use apihub_server::{api, config::Config, db, housekeeping};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::for_service("apihub-server").with_env()?;
    let _logging_guard = init_logging(&log_config)?;

    info!("Starting APIHUB Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let pool = db::create_pool(&(&config.database).into()).await?;
    db::run_migrations(&pool).await?;

    let shutdown = CancellationToken::new();

    let housekeeping_handle = if config.housekeeping.enabled {
        Some(housekeeping::spawn(
            pool.clone(),
            config.housekeeping,
            config.queue,
            shutdown.child_token(),
        ))
    } else {
        info!("Housekeeping is disabled (HOUSEKEEPING_ENABLED=false)");
        None
    };

    let app = api::create_router(api::AppState::new(pool.clone(), &config), &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    shutdown.cancel();
    if let Some(handle) = housekeeping_handle {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Housekeeping task ended abnormally");
        }
    }
    pool.close().await;

    info!("Server shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
