//! SMSFlow Worker - dispatch workers for the SMS queue.
//!
//! Runs `DISPATCH_WORKERS` claim loops against the shared database. All loops
//! share one gateway concurrency limiter, so `GATEWAY_CONCURRENCY` bounds the
//! in-flight sends of the whole process. A reaper returns claims abandoned by
//! crashed workers to the queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smsflow::{gateway, Config, Database, DispatchQueue, Dispatcher, EventBus, StatusMachine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    // Load configuration from environment
    let config = Arc::new(Config::from_env());
    info!(
        database_path = %config.database_path.display(),
        workers = config.dispatch_workers,
        batch_size = config.dispatch_batch_size,
        gateway_concurrency = config.gateway_concurrency,
        gateway_mock = config.sms_gateway_mock,
        "config_loaded"
    );

    let db = Database::open(&config.database_path)
        .await
        .context("Failed to open database")?;
    let gateway = gateway::from_config(&config).context("Failed to build SMS gateway client")?;

    let bus = EventBus::default();
    let machine = StatusMachine::new(db.pool().clone(), bus.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        DispatchQueue::new(db.pool().clone(), bus),
        machine.clone(),
        gateway,
        Arc::new(Semaphore::new(config.gateway_concurrency)),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for n in 0..config.dispatch_workers {
        let worker_id = format!("{}-{}", hostname(), n);
        tasks.spawn(Arc::clone(&dispatcher).run_worker(worker_id, shutdown.clone()));
    }
    tasks.spawn(reap_stale_claims(machine, config.clone(), shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    db.close().await;
    info!("worker_shutdown_complete");

    Ok(())
}

/// Periodically re-queue claims older than `CLAIM_TIMEOUT_SECS`.
async fn reap_stale_claims(machine: StatusMachine, config: Arc<Config>, shutdown: CancellationToken) {
    let timeout = config.claim_timeout();
    let every = (timeout / 4).max(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
        if let Err(e) = machine.reap_stale_claims(timeout).await {
            warn!(error = %e, kind = ?e.kind(), "stale_claim_reap_failed");
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("pid{}", std::process::id()))
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

    info!("worker_shutting_down");
}
