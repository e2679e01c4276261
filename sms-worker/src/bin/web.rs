//! SMSFlow Web Server - HTTP surface of the pipeline.
//!
//! This binary:
//! - Serves the upload, campaign, template, message and webhook APIs
//! - Verifies and applies gateway delivery callbacks
//! - Hosts the import worker that parses spooled uploads in the background
//! - Purges expired imports once an hour

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::{net::TcpListener, signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smsflow::import::{fail_interrupted_imports, purge_expired_imports, spawn_import_worker};
use smsflow::web::router;
use smsflow::webhooks::signature::is_signature_verification_enabled;
use smsflow::{AppState, Config, Database, EventBus, ImportRegistry, StatusMachine};

/// Uploads waiting for the import worker before new ones wait on send.
const IMPORT_QUEUE_DEPTH: usize = 16;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!(
        port = config.port,
        database_path = %config.database_path.display(),
        callback_signing_configured =
            is_signature_verification_enabled(&config.callback_signing_key),
        import_max_rows = config.import_max_rows,
        import_max_file_bytes = config.import_max_file_bytes,
        "config_loaded"
    );

    let db = Database::open(&config.database_path)
        .await
        .context("Failed to open database")?;
    fail_interrupted_imports(db.pool())
        .await
        .context("Failed to recover interrupted imports")?;

    let shutdown = CancellationToken::new();
    let registry = ImportRegistry::default();
    let (import_tx, import_rx) = mpsc::channel(IMPORT_QUEUE_DEPTH);
    let import_worker = spawn_import_worker(
        db.pool().clone(),
        config.clone(),
        registry.clone(),
        import_rx,
        shutdown.clone(),
    );
    let purger = tokio::spawn(purge_loop(db.pool().clone(), config.clone(), shutdown.clone()));

    // Create application state
    let machine = StatusMachine::new(db.pool().clone(), EventBus::default());
    let state = AppState::new(config.clone(), machine, import_tx, registry);
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = import_worker.await {
        warn!(error = %e, "import_worker_join_failed");
    }
    if let Err(e) = purger.await {
        warn!(error = %e, "purge_loop_join_failed");
    }
    db.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

async fn purge_loop(pool: SqlitePool, config: Arc<Config>, shutdown: CancellationToken) {
    loop {
        if let Err(e) = purge_expired_imports(&pool, config.import_retention()).await {
            warn!(error = %e, "import_purge_failed");
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(PURGE_INTERVAL) => {}
        }
    }
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

    info!("web_server_shutting_down");
}
