//! Domain error type shared by every pipeline component.
//!
//! Errors are a closed set of variants carrying structured context. Callers at
//! a reporting boundary (HTTP handlers, worker loops) switch on [`Error::kind`]
//! or the variant itself; nothing is caught generically.

use crate::model::MessageStatus;

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error taxonomy used to decide how a failure is reported and whether it
/// may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or row. Reported synchronously, never retried.
    Validation,
    /// A size or concurrency ceiling was hit.
    ResourceExhausted,
    /// Infrastructure hiccup that may succeed on retry.
    Transient,
    /// Definitive refusal; retrying will not help.
    Permanent,
    /// Storage or I/O failure that aborts the enclosing operation.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("import exceeds the row ceiling of {limit} rows")]
    ImportTooLarge { limit: u64 },

    #[error("upload exceeds the size ceiling of {limit} bytes")]
    FileTooLarge { limit: u64 },

    #[error("owner already has {limit} imports in progress")]
    TooManyImports { limit: u64 },

    #[error("template {template_id} cannot be used: {reason}")]
    TemplateNotUsable { template_id: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Classify this error into the reporting taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::TemplateNotUsable { .. }
            | Error::NotFound { .. }
            | Error::InvalidTransition { .. }
            | Error::Conflict(_)
            | Error::Csv(_)
            | Error::Serialization(_) => ErrorKind::Validation,
            Error::ImportTooLarge { .. }
            | Error::FileTooLarge { .. }
            | Error::TooManyImports { .. } => ErrorKind::ResourceExhausted,
            Error::Database(e) if is_lock_contention(e) => ErrorKind::Transient,
            Error::Cancelled => ErrorKind::Permanent,
            Error::Database(_) | Error::Io(_) => ErrorKind::Fatal,
        }
    }
}

/// SQLite reports a held write lock as `SQLITE_BUSY` (5) or `SQLITE_LOCKED` (6).
fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
