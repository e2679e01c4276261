//! Configuration module for environment variable parsing.
//!
//! Every binary builds one [`Config`] at startup and shares it as `Arc<Config>`.
//! Nothing reads the environment after that.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file shared by all binaries
    pub database_path: PathBuf,

    /// Port for the web server to listen on
    pub port: u16,

    // =========================================================================
    // Import
    // =========================================================================

    /// Directory for spooled uploads (system temp dir when unset)
    pub import_scratch_dir: Option<PathBuf>,

    /// Rows committed per transaction
    pub import_chunk_size: usize,

    /// Data rows allowed in a single upload
    pub import_max_rows: u64,

    /// Bytes allowed in a single upload
    pub import_max_file_bytes: u64,

    /// Imports an owner may have in `processing` at once
    pub import_max_active_per_owner: u64,

    /// Per-row errors stored on a job; counters stay exact past this
    pub import_max_recorded_errors: usize,

    /// Terminal imports older than this are purged
    pub import_retention_hours: u64,

    /// Accepted multipart content types for uploads
    pub upload_content_types: Vec<String>,

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Number of claim loops per worker process
    pub dispatch_workers: usize,

    /// Messages claimed per batch
    pub dispatch_batch_size: u32,

    /// Sleep between empty claims
    pub dispatch_poll_interval_ms: u64,

    /// Process-wide ceiling on in-flight gateway calls
    pub gateway_concurrency: usize,

    /// Gateway calls allowed per message before it fails
    pub send_max_attempts: u32,

    /// Base and cap of the send retry backoff in milliseconds
    pub send_backoff_ms: (u64, u64),

    /// Claims older than this are returned to the queue
    pub claim_timeout_secs: u64,

    // =========================================================================
    // Gateway
    // =========================================================================

    /// Base URL of the SMS gateway API
    pub sms_gateway_url: Option<String>,

    pub sms_gateway_login: Option<String>,

    pub sms_gateway_password: Option<String>,

    /// Per-request gateway timeout
    pub sms_gateway_timeout_ms: u64,

    /// Use the in-process simulated gateway instead of HTTP
    pub sms_gateway_mock: bool,

    /// HMAC key for inbound delivery callbacks (verification off when unset)
    pub callback_signing_key: Option<String>,

    /// Maximum age in seconds for callback timestamps
    pub callback_signature_max_age: u64,

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Per-request timeout for subscriber endpoints
    pub webhook_timeout_ms: u64,

    /// Attempts per delivery before it is marked failed
    pub webhook_max_attempts: u32,

    /// Base and cap of the delivery retry backoff in milliseconds
    pub webhook_backoff_ms: (u64, u64),

    /// Concurrent deliveries in the notifier
    pub webhook_concurrency: usize,

    /// Sleep between empty outbox polls
    pub webhook_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("smsflow.db"),
            port: 8080,
            import_scratch_dir: None,
            import_chunk_size: 1000,
            import_max_rows: 1_000_000,
            import_max_file_bytes: 100 * 1024 * 1024,
            import_max_active_per_owner: 5,
            import_max_recorded_errors: 100,
            import_retention_hours: 168,
            upload_content_types: vec![
                "text/csv".to_string(),
                "text/plain".to_string(),
                "application/csv".to_string(),
            ],
            dispatch_workers: 2,
            dispatch_batch_size: 100,
            dispatch_poll_interval_ms: 1000,
            gateway_concurrency: 10,
            send_max_attempts: 3,
            send_backoff_ms: (1000, 60_000),
            claim_timeout_secs: 300,
            sms_gateway_url: None,
            sms_gateway_login: None,
            sms_gateway_password: None,
            sms_gateway_timeout_ms: 10_000,
            sms_gateway_mock: true,
            callback_signing_key: None,
            callback_signature_max_age: 300, // 5 minutes
            webhook_timeout_ms: 10_000,
            webhook_max_attempts: 5,
            webhook_backoff_ms: (2000, 300_000),
            webhook_concurrency: 8,
            webhook_poll_interval_ms: 1000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.database_path),

            port: parse_or("PORT", d.port),

            import_scratch_dir: env::var("IMPORT_SCRATCH_DIR").ok().map(PathBuf::from),
            import_chunk_size: parse_or("IMPORT_CHUNK_SIZE", d.import_chunk_size).max(1),
            import_max_rows: parse_or("IMPORT_MAX_ROWS", d.import_max_rows),
            import_max_file_bytes: parse_or("IMPORT_MAX_FILE_BYTES", d.import_max_file_bytes),
            import_max_active_per_owner: parse_or(
                "IMPORT_MAX_ACTIVE_PER_OWNER",
                d.import_max_active_per_owner,
            ),
            import_max_recorded_errors: parse_or(
                "IMPORT_MAX_RECORDED_ERRORS",
                d.import_max_recorded_errors,
            ),
            import_retention_hours: parse_or("IMPORT_RETENTION_HOURS", d.import_retention_hours),
            upload_content_types: parse_csv("UPLOAD_CONTENT_TYPES")
                .filter(|types| !types.is_empty())
                .unwrap_or(d.upload_content_types),

            dispatch_workers: parse_or("DISPATCH_WORKERS", d.dispatch_workers).max(1),
            dispatch_batch_size: parse_or("DISPATCH_BATCH_SIZE", d.dispatch_batch_size).max(1),
            dispatch_poll_interval_ms: parse_or(
                "DISPATCH_POLL_INTERVAL_MS",
                d.dispatch_poll_interval_ms,
            ),
            gateway_concurrency: parse_or("GATEWAY_CONCURRENCY", d.gateway_concurrency).max(1),
            send_max_attempts: parse_or("SEND_MAX_ATTEMPTS", d.send_max_attempts).max(1),
            send_backoff_ms: parse_range("SEND_BACKOFF_RANGE_MS", d.send_backoff_ms),
            claim_timeout_secs: parse_or("CLAIM_TIMEOUT_SECS", d.claim_timeout_secs),

            sms_gateway_url: env::var("SMS_GATEWAY_URL").ok(),
            sms_gateway_login: env::var("SMS_GATEWAY_LOGIN").ok(),
            sms_gateway_password: env::var("SMS_GATEWAY_PASSWORD").ok(),
            sms_gateway_timeout_ms: parse_or("SMS_GATEWAY_TIMEOUT_MS", d.sms_gateway_timeout_ms),
            sms_gateway_mock: parse_or("SMS_GATEWAY_MOCK", d.sms_gateway_mock),
            callback_signing_key: env::var("CALLBACK_SIGNING_KEY").ok(),
            callback_signature_max_age: parse_or(
                "CALLBACK_SIGNATURE_MAX_AGE",
                d.callback_signature_max_age,
            ),

            webhook_timeout_ms: parse_or("WEBHOOK_TIMEOUT_MS", d.webhook_timeout_ms),
            webhook_max_attempts: parse_or("WEBHOOK_MAX_ATTEMPTS", d.webhook_max_attempts).max(1),
            webhook_backoff_ms: parse_range("WEBHOOK_BACKOFF_RANGE_MS", d.webhook_backoff_ms),
            webhook_concurrency: parse_or("WEBHOOK_CONCURRENCY", d.webhook_concurrency).max(1),
            webhook_poll_interval_ms: parse_or(
                "WEBHOOK_POLL_INTERVAL_MS",
                d.webhook_poll_interval_ms,
            ),
        }
    }

    pub fn dispatch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_interval_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn sms_gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.sms_gateway_timeout_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn webhook_poll_interval(&self) -> Duration {
        Duration::from_millis(self.webhook_poll_interval_ms)
    }

    pub fn import_retention(&self) -> Duration {
        Duration::from_secs(self.import_retention_hours * 3600)
    }
}

/// Parse a single value, falling back to `default` when unset or malformed.
fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}

/// Parse a comma-separated range like "500,5000" into a tuple.
fn parse_range(name: &str, default: (u64, u64)) -> (u64, u64) {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        warn!(env_var = name, value = %raw, "Invalid range format, using default");
        return default;
    }

    let min = parts[0].trim().parse::<u64>();
    let max = parts[1].trim().parse::<u64>();

    match (min, max) {
        (Ok(min), Ok(max)) if min <= max => (min, max),
        _ => {
            warn!(env_var = name, value = %raw, "Invalid range values, using default");
            default
        }
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
