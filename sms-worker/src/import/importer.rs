//! Chunk committer and job finalization.

use std::path::PathBuf;

use sqlx::types::Json;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::parser::{self, Chunk, ParseLimits};
use super::ImportTask;
use crate::config::Config;
use crate::db::{self, new_id, to_db};
use crate::error::{Error, Result};
use crate::model::{ImportFailure, ImportJob, ImportStatus, RowError};

/// Chunks buffered between parser and committer.
const CHUNK_BUFFER: usize = 2;

/// Running totals for one job, mirrored to its row after every chunk.
#[derive(Debug, Default)]
struct Tally {
    seen: u64,
    inserted: u64,
    rejected: u64,
    /// First errors only; counters stay exact past the cap.
    recorded: Vec<RowError>,
}

impl Tally {
    fn record(&mut self, err: RowError, cap: usize) {
        self.rejected += 1;
        if self.recorded.len() < cap {
            self.recorded.push(err);
        }
    }
}

/// Insert one chunk in a single transaction and update the job counters.
///
/// Rows whose phone already exists in this import are rejected. Fails with
/// `Cancelled` if the job left `processing` (for example through
/// `cancel_import`), in which case nothing from the chunk is kept.
async fn commit_chunk(
    pool: &SqlitePool,
    job_id: &str,
    chunk: Chunk,
    tally: &mut Tally,
    max_errors: usize,
) -> Result<()> {
    let now = to_db(db::now());
    let mut tx = pool.begin().await?;

    let mut inserted = 0u64;
    let mut rejected = chunk.errors;
    for row in chunk.rows {
        let result = sqlx::query(
            "INSERT INTO contacts (id, import_id, row_index, phone, name, tags, variables, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (import_id, phone) DO NOTHING",
        )
        .bind(new_id("con"))
        .bind(job_id)
        .bind(row.row as i64)
        .bind(&row.phone)
        .bind(&row.name)
        .bind(Json(&row.tags))
        .bind(Json(&row.variables))
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            inserted += 1;
        } else {
            rejected.push(RowError {
                row: row.row,
                column: Some("phone".to_string()),
                message: format!("duplicate phone {} in this import", row.phone),
            });
        }
    }

    let mut next = Tally {
        seen: tally.seen + chunk.seen,
        inserted: tally.inserted + inserted,
        rejected: tally.rejected,
        recorded: tally.recorded.clone(),
    };
    rejected.sort_by_key(|e| e.row);
    for err in rejected {
        next.record(err, max_errors);
    }

    let updated = sqlx::query(
        "UPDATE import_jobs SET rows_seen = ?1, rows_inserted = ?2, rows_rejected = ?3, errors = ?4 \
         WHERE id = ?5 AND status = 'processing'",
    )
    .bind(next.seen as i64)
    .bind(next.inserted as i64)
    .bind(next.rejected as i64)
    .bind(Json(&next.recorded))
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(Error::Cancelled);
    }
    tx.commit().await?;

    info!(
        import_id = %job_id,
        rows_seen = next.seen,
        inserted = inserted,
        rejected = next.rejected - tally.rejected,
        "import_chunk_committed"
    );
    *tally = next;
    Ok(())
}

/// Move a job to its terminal state. A job already moved (cancelled from
/// outside) keeps its state.
async fn finalize(
    pool: &SqlitePool,
    job_id: &str,
    status: ImportStatus,
    failure: Option<(ImportFailure, String)>,
) -> Result<ImportJob> {
    let (kind, reason) = match failure {
        Some((kind, reason)) => (Some(kind.as_str()), Some(reason)),
        None => (None, None),
    };
    sqlx::query(
        "UPDATE import_jobs SET status = ?1, failure_kind = ?2, failure_reason = ?3, completed_at = ?4 \
         WHERE id = ?5 AND status = 'processing'",
    )
    .bind(status.as_str())
    .bind(kind)
    .bind(reason)
    .bind(to_db(db::now()))
    .bind(job_id)
    .execute(pool)
    .await?;

    sqlx::query_as("SELECT * FROM import_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("import", job_id))
}

/// Map how the run ended to the job's terminal state.
fn terminal_state(outcome: &Result<()>) -> (ImportStatus, Option<(ImportFailure, String)>) {
    match outcome {
        Ok(()) => (ImportStatus::Success, None),
        Err(Error::Cancelled) => (ImportStatus::Cancelled, None),
        Err(e @ Error::ImportTooLarge { .. }) => (
            ImportStatus::Failed,
            Some((ImportFailure::RowLimitExceeded, e.to_string())),
        ),
        Err(Error::Validation(msg)) => (
            ImportStatus::Failed,
            Some((ImportFailure::InvalidHeader, msg.clone())),
        ),
        Err(e) => (
            ImportStatus::Failed,
            Some((ImportFailure::Storage, e.to_string())),
        ),
    }
}

/// Parse and commit one spooled upload, then finalize the job.
///
/// The scratch file is removed before returning on every path.
pub async fn run_import(
    pool: &SqlitePool,
    config: &Config,
    task: ImportTask,
    cancel: CancellationToken,
) -> Result<ImportJob> {
    let ImportTask { job_id, path } = task;
    let scratch: PathBuf = path.to_path_buf();
    let limits = ParseLimits {
        chunk_size: config.import_chunk_size,
        max_rows: config.import_max_rows,
    };

    let (tx, mut rx) = mpsc::channel::<Chunk>(CHUNK_BUFFER);
    let parse_cancel = cancel.clone();
    let parser = tokio::task::spawn_blocking(move || {
        parser::parse_file(&scratch, limits, &tx, &parse_cancel)
    });

    let mut tally = Tally::default();
    let mut committed: Result<()> = Ok(());
    while let Some(chunk) = rx.recv().await {
        if cancel.is_cancelled() {
            committed = Err(Error::Cancelled);
            break;
        }
        if let Err(e) = commit_chunk(
            pool,
            &job_id,
            chunk,
            &mut tally,
            config.import_max_recorded_errors,
        )
        .await
        {
            committed = Err(e);
            break;
        }
    }
    // Unblocks a parser waiting on a full channel.
    drop(rx);
    if committed.is_err() {
        cancel.cancel();
    }

    let parsed = match parser.await {
        Ok(result) => result.map(|_| ()),
        Err(e) => {
            error!(import_id = %job_id, error = %e, "import_parser_panicked");
            Err(Error::Io(std::io::Error::other(e.to_string())))
        }
    };

    // A commit failure explains a parser stopped by it.
    let outcome = match (committed, parsed) {
        (Err(e), _) => Err(e),
        (Ok(()), parsed) => parsed,
    };

    if let Err(e) = path.close() {
        warn!(import_id = %job_id, error = %e, "import_scratch_cleanup_failed");
    }

    let (status, failure) = terminal_state(&outcome);
    let job = finalize(pool, &job_id, status, failure).await?;
    match &outcome {
        Ok(()) => info!(
            import_id = %job.id,
            rows_seen = job.rows_seen,
            inserted = job.rows_inserted,
            rejected = job.rows_rejected,
            "import_completed"
        ),
        Err(e) => warn!(
            import_id = %job.id,
            status = %job.status,
            error = %e,
            inserted = job.rows_inserted,
            "import_stopped"
        ),
    }
    Ok(job)
}
