//! SQLite storage shared by every binary.
//!
//! All three processes open the same database file. WAL mode lets readers
//! proceed while one writer holds the lock; the busy timeout makes competing
//! writers wait instead of failing. Transactions in this crate always start
//! with a write so that the wait happens at `BEGIN`-time rather than as a
//! failed snapshot upgrade halfway through.

pub mod rows;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

const SCHEMA: &str = include_str!("schema.sql");

/// Handle to the pipeline database.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        info!(path = %path.display(), "database_opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Current time, truncated to the stored precision.
pub fn now() -> DateTime<Utc> {
    from_db(&to_db(Utc::now())).unwrap_or_else(|_| Utc::now())
}

/// Render a timestamp in the fixed-width stored form.
pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn to_db_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(to_db)
}

pub fn from_db(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

/// Generate a prefixed identifier such as `msg_3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
pub(crate) async fn open_temp() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("smsflow.db")).await.unwrap();
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_are_fixed_width() {
        let whole = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(to_db(whole), "2026-01-02T03:04:05.000000Z");

        let later = whole + chrono::Duration::microseconds(1);
        assert!(to_db(whole) < to_db(later));
        assert_eq!(from_db(&to_db(later)).unwrap(), later);
    }

    #[test]
    fn test_new_id_is_prefixed() {
        let id = new_id("msg");
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 4 + 32);
        assert_ne!(new_id("msg"), id);
    }

    #[tokio::test]
    async fn test_open_applies_schema_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smsflow.db");

        let db = Database::open(&path).await.unwrap();
        db.close().await;
        let db = Database::open(&path).await.unwrap();

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'messages'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(count, 1);
    }
}
