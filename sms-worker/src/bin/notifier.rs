//! SMSFlow Notifier - webhook delivery worker.
//!
//! Drains the webhook outbox written alongside every status change. Runs with
//! its own concurrency budget (`WEBHOOK_CONCURRENCY`), independent of the
//! gateway limiter in the dispatch workers, so slow subscribers never hold
//! up sends.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smsflow::{Config, Database, Notifier};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("notifier_starting");

    let config = Arc::new(Config::from_env());
    info!(
        database_path = %config.database_path.display(),
        concurrency = config.webhook_concurrency,
        max_attempts = config.webhook_max_attempts,
        timeout_ms = config.webhook_timeout_ms,
        "config_loaded"
    );

    let db = Database::open(&config.database_path)
        .await
        .context("Failed to open database")?;
    let notifier = Arc::new(
        Notifier::new(db.pool().clone(), config.clone()).context("Failed to build notifier")?,
    );

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(Arc::clone(&notifier).run(shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();
    if let Err(e) = worker.await {
        warn!(error = %e, "notifier_join_failed");
    }

    db.close().await;
    info!("notifier_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("notifier_shutting_down");
}
