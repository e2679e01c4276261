//! Streaming contact import.
//!
//! The HTTP handler creates the job (enforcing the per-owner cap), spools the
//! upload to a scratch file and hands an [`ImportTask`] to the import worker
//! over a channel, returning before any row is parsed. The worker parses on a
//! blocking thread and commits contacts chunk by chunk.

pub mod importer;
pub mod parser;
pub mod spool;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::SqlitePool;
use tempfile::TempPath;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{self, new_id, to_db};
use crate::error::{Error, Result};
use crate::model::ImportJob;

pub use importer::run_import;
pub use spool::{Spooled, Spooler};

/// A spooled upload waiting to be parsed.
#[derive(Debug)]
pub struct ImportTask {
    pub job_id: String,
    /// Removed when the task is dropped, processed or not.
    pub path: TempPath,
}

/// Cancellation handles of imports that have not finished.
#[derive(Clone, Default)]
pub struct ImportRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl ImportRegistry {
    pub fn register(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(job_id.to_string(), token.clone());
        }
        token
    }

    fn token(&self, job_id: &str) -> Option<CancellationToken> {
        self.tokens.lock().ok()?.get(job_id).cloned()
    }

    fn remove(&self, job_id: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(job_id);
        }
    }
}

/// Check the upload's file name and declared content type independently.
pub fn validate_upload(filename: &str, content_type: Option<&str>, config: &Config) -> Result<()> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if !matches!(extension.as_deref(), Some("csv") | Some("txt")) {
        return Err(Error::validation(format!(
            "file {filename} must have a .csv or .txt extension"
        )));
    }

    let declared = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();
    if !config
        .upload_content_types
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&declared))
    {
        return Err(Error::validation(format!(
            "content type '{declared}' is not accepted for uploads"
        )));
    }
    Ok(())
}

/// Create a `processing` job unless the owner is at the concurrency cap.
///
/// The count and insert are one statement, so two uploads racing for the
/// last slot cannot both get it.
pub async fn create_job(
    pool: &SqlitePool,
    config: &Config,
    owner_id: &str,
    filename: &str,
) -> Result<ImportJob> {
    let limit = config.import_max_active_per_owner;
    let job: Option<ImportJob> = sqlx::query_as(
        "INSERT INTO import_jobs (id, owner_id, filename, status, created_at) \
         SELECT ?1, ?2, ?3, 'processing', ?4 \
         WHERE (SELECT COUNT(*) FROM import_jobs \
                WHERE owner_id = ?2 AND status = 'processing') < ?5 \
         RETURNING *",
    )
    .bind(new_id("imp"))
    .bind(owner_id)
    .bind(filename)
    .bind(to_db(db::now()))
    .bind(limit as i64)
    .fetch_optional(pool)
    .await?;

    let job = job.ok_or(Error::TooManyImports { limit })?;
    info!(import_id = %job.id, owner_id = %owner_id, filename = %filename, "import_job_created");
    Ok(job)
}

/// Store the hash and size of a spooled upload on its job.
pub async fn record_upload(pool: &SqlitePool, job_id: &str, spooled: &Spooled) -> Result<()> {
    sqlx::query("UPDATE import_jobs SET content_hash = ?1, size_bytes = ?2 WHERE id = ?3")
        .bind(&spooled.content_hash)
        .bind(spooled.size_bytes as i64)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Fail a job that never reached the worker (spooling error, full queue).
pub async fn reject_job(
    pool: &SqlitePool,
    job_id: &str,
    err: &Error,
) -> Result<()> {
    let kind = match err {
        Error::FileTooLarge { .. } => "file_too_large",
        Error::ImportTooLarge { .. } => "row_limit_exceeded",
        _ => "storage",
    };
    sqlx::query(
        "UPDATE import_jobs SET status = 'failed', failure_kind = ?1, failure_reason = ?2, \
         completed_at = ?3 WHERE id = ?4 AND status = 'processing'",
    )
    .bind(kind)
    .bind(err.to_string())
    .bind(to_db(db::now()))
    .bind(job_id)
    .execute(pool)
    .await?;
    warn!(import_id = %job_id, failure_kind = kind, error = %err, "import_rejected");
    Ok(())
}

pub async fn get_import(pool: &SqlitePool, owner_id: &str, id: &str) -> Result<ImportJob> {
    sqlx::query_as("SELECT * FROM import_jobs WHERE id = ?1 AND owner_id = ?2")
        .bind(id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("import", id))
}

/// Cancel a running import. Chunks already committed stay; no further chunk is.
pub async fn cancel_import(
    pool: &SqlitePool,
    registry: &ImportRegistry,
    owner_id: &str,
    id: &str,
) -> Result<ImportJob> {
    let job: Option<ImportJob> = sqlx::query_as(
        "UPDATE import_jobs SET status = 'cancelled', completed_at = ?1 \
         WHERE id = ?2 AND owner_id = ?3 AND status = 'processing' RETURNING *",
    )
    .bind(to_db(db::now()))
    .bind(id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    let Some(job) = job else {
        let existing = get_import(pool, owner_id, id).await?;
        return Err(Error::Conflict(format!(
            "import {id} is already {}",
            existing.status
        )));
    };
    if let Some(token) = registry.token(id) {
        token.cancel();
    }
    info!(import_id = %id, "import_cancelled");
    Ok(job)
}

/// Delete finished imports older than `retention`, with their contacts.
pub async fn purge_expired_imports(pool: &SqlitePool, retention: Duration) -> Result<u64> {
    let cutoff = db::now()
        - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
    let purged = sqlx::query(
        "DELETE FROM import_jobs WHERE status <> 'processing' AND completed_at < ?",
    )
    .bind(to_db(cutoff))
    .execute(pool)
    .await?
    .rows_affected();

    if purged > 0 {
        info!(purged = purged, "expired_imports_purged");
    }
    Ok(purged)
}

/// Fail jobs left `processing` by a previous process.
pub async fn fail_interrupted_imports(pool: &SqlitePool) -> Result<u64> {
    let failed = sqlx::query(
        "UPDATE import_jobs SET status = 'failed', failure_kind = 'storage', \
         failure_reason = 'interrupted by restart', completed_at = ?1 \
         WHERE status = 'processing'",
    )
    .bind(to_db(db::now()))
    .execute(pool)
    .await?
    .rows_affected();

    if failed > 0 {
        warn!(failed = failed, "interrupted_imports_failed");
    }
    Ok(failed)
}

/// Run imports one at a time until `shutdown` fires.
///
/// The import in progress at shutdown finishes; tasks still queued are failed
/// and their scratch files removed.
pub fn spawn_import_worker(
    pool: SqlitePool,
    config: Arc<Config>,
    registry: ImportRegistry,
    mut tasks: mpsc::Receiver<ImportTask>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("import_worker_started");
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let job_id = task.job_id.clone();
            let cancel = registry.token(&job_id).unwrap_or_default();
            if let Err(e) = run_import(&pool, &config, task, cancel).await {
                error!(import_id = %job_id, error = %e, "import_finalize_failed");
            }
            registry.remove(&job_id);
        }

        tasks.close();
        while let Ok(task) = tasks.try_recv() {
            let err = Error::Io(std::io::Error::other("import worker shut down"));
            if let Err(e) = reject_job(&pool, &task.job_id, &err).await {
                error!(import_id = %task.job_id, error = %e, "import_reject_failed");
            }
            registry.remove(&task.job_id);
        }
        info!("import_worker_stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_temp;
    use crate::model::ImportStatus;

    #[test]
    fn test_validate_upload_checks_extension_and_type() {
        let config = Config::default();
        assert!(validate_upload("list.csv", Some("text/csv"), &config).is_ok());
        assert!(validate_upload("LIST.TXT", Some("text/plain; charset=utf-8"), &config).is_ok());
        assert!(validate_upload("list.xlsx", Some("text/csv"), &config).is_err());
        assert!(validate_upload("list.csv", Some("application/pdf"), &config).is_err());
        assert!(validate_upload("list.csv", None, &config).is_err());
    }

    #[tokio::test]
    async fn test_active_job_cap() {
        let (_dir, db) = open_temp().await;
        let config = Config {
            import_max_active_per_owner: 2,
            ..Config::default()
        };
        let first = create_job(db.pool(), &config, "o", "a.csv").await.unwrap();
        create_job(db.pool(), &config, "o", "b.csv").await.unwrap();
        assert!(matches!(
            create_job(db.pool(), &config, "o", "c.csv").await,
            Err(Error::TooManyImports { limit: 2 })
        ));
        // Other owners are unaffected.
        create_job(db.pool(), &config, "p", "a.csv").await.unwrap();

        let registry = ImportRegistry::default();
        let token = registry.register(&first.id);
        let cancelled = cancel_import(db.pool(), &registry, "o", &first.id).await.unwrap();
        assert_eq!(cancelled.status, ImportStatus::Cancelled);
        assert!(token.is_cancelled());
        assert!(matches!(
            cancel_import(db.pool(), &registry, "o", &first.id).await,
            Err(Error::Conflict(_))
        ));
        create_job(db.pool(), &config, "o", "c.csv").await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_removes_old_terminal_jobs_and_contacts() {
        let (_dir, db) = open_temp().await;
        let config = Config::default();
        let old = create_job(db.pool(), &config, "o", "old.csv").await.unwrap();
        let running = create_job(db.pool(), &config, "o", "running.csv").await.unwrap();

        let long_ago = to_db(db::now() - chrono::Duration::days(30));
        sqlx::query("UPDATE import_jobs SET status = 'success', completed_at = ? WHERE id = ?")
            .bind(&long_ago)
            .bind(&old.id)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO contacts (id, import_id, row_index, phone, created_at) \
             VALUES ('con_1', ?1, 1, '+15550000001', ?2)",
        )
        .bind(&old.id)
        .bind(&long_ago)
        .execute(db.pool())
        .await
        .unwrap();

        let purged = purge_expired_imports(db.pool(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(get_import(db.pool(), "o", &running.id).await.is_ok());
        let (contacts,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contacts")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(contacts, 0);
    }

    #[tokio::test]
    async fn test_worker_processes_queued_task() {
        let (_dir, db) = open_temp().await;
        let scratch_dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::default());
        let job = create_job(db.pool(), &config, "o", "a.csv").await.unwrap();

        let mut spooler = Spooler::new(Some(scratch_dir.path()), 1024).unwrap();
        spooler.write_chunk(b"phone\n+15550000001\n").await.unwrap();
        let spooled = spooler.finish().await.unwrap();
        record_upload(db.pool(), &job.id, &spooled).await.unwrap();

        let registry = ImportRegistry::default();
        registry.register(&job.id);
        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let worker = spawn_import_worker(
            db.pool().clone(),
            config,
            registry,
            rx,
            shutdown.clone(),
        );
        tx.send(ImportTask {
            job_id: job.id.clone(),
            path: spooled.path,
        })
        .await
        .unwrap();
        drop(tx);
        worker.await.unwrap();

        let job = get_import(db.pool(), "o", &job.id).await.unwrap();
        assert_eq!(job.status, ImportStatus::Success);
        assert_eq!(job.rows_inserted, 1);
        assert_eq!(job.size_bytes, 19);
        assert!(job.content_hash.is_some());
        assert_eq!(std::fs::read_dir(scratch_dir.path()).unwrap().count(), 0);
    }
}
