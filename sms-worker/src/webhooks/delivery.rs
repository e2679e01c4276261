//! Outbox delivery worker.
//!
//! Leases due `pending` deliveries with a fresh token, POSTs each payload to
//! its subscriber and records the outcome under the same token. A delivery
//! is retried with backoff until it succeeds or runs out of attempts, at
//! which point it stays `failed` for operators to inspect. Nothing here ever
//! touches message status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use reqwest::Client;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::signature::{sign, unix_now, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::config::Config;
use crate::db::{self, to_db};
use crate::error::{Error, Result};
use crate::model::{DeliveryStatus, Webhook, WebhookDelivery};
use crate::util::backoff::backoff_delay;

/// Grace added to the request timeout before an in-flight lease is presumed lost.
const LEASE_GRACE: Duration = Duration::from_secs(60);

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Delivered { status_code: u16 },
    Failed { status_code: Option<u16>, error: String },
}

/// Totals for one leased batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
}

pub struct Notifier {
    pool: SqlitePool,
    config: Arc<Config>,
    client: Client,
    worker_id: String,
}

impl Notifier {
    pub fn new(pool: SqlitePool, config: Arc<Config>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.webhook_timeout())
            .user_agent(concat!("smsflow-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::validation(format!("failed to build webhook client: {e}")))?;
        Ok(Self {
            pool,
            config,
            client,
            worker_id: format!("notifier-{}", Uuid::new_v4().simple()),
        })
    }

    /// Deliver until `shutdown` fires.
    ///
    /// Polls the outbox every `WEBHOOK_POLL_INTERVAL_MS` while it is empty.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(worker_id = %self.worker_id, "webhook_notifier_started");
        let idle = self.config.webhook_poll_interval();

        while !shutdown.is_cancelled() {
            if let Err(e) = self.release_stale_leases().await {
                warn!(error = %e, "webhook_lease_release_failed");
            }

            let batch = match self.lease_due(self.config.webhook_concurrency).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, kind = ?e.kind(), "webhook_lease_failed");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
                continue;
            }

            let report = self.deliver_batch(batch).await;
            info!(
                delivered = report.delivered,
                retrying = report.retrying,
                failed = report.failed,
                "webhook_batch_complete"
            );
        }

        info!(worker_id = %self.worker_id, "webhook_notifier_stopped");
    }

    /// Lease up to `limit` due deliveries. Returns them with the lease token.
    async fn lease_due(&self, limit: usize) -> Result<Vec<(WebhookDelivery, String)>> {
        let token = Uuid::new_v4().simple().to_string();
        let now = to_db(db::now());
        let leased: Vec<WebhookDelivery> = sqlx::query_as(
            "UPDATE webhook_deliveries \
             SET status = 'in_flight', lease_token = ?1, leased_at = ?2, updated_at = ?2 \
             WHERE id IN ( \
                 SELECT id FROM webhook_deliveries \
                 WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?2) \
                 ORDER BY next_retry_at, created_at, id LIMIT ?3) \
             RETURNING *",
        )
        .bind(&token)
        .bind(&now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(leased.into_iter().map(|d| (d, token.clone())).collect())
    }

    /// Return leases held longer than any attempt can take to `pending`.
    async fn release_stale_leases(&self) -> Result<u64> {
        let horizon = self.config.webhook_timeout() + LEASE_GRACE;
        let cutoff = db::now() - ChronoDuration::from_std(horizon).unwrap_or_else(|_| ChronoDuration::zero());
        let released = sqlx::query(
            "UPDATE webhook_deliveries SET status = 'pending', lease_token = NULL, leased_at = NULL \
             WHERE status = 'in_flight' AND leased_at < ?",
        )
        .bind(to_db(cutoff))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released > 0 {
            warn!(released = released, "webhook_stale_leases_released");
        }
        Ok(released)
    }

    pub async fn deliver_batch(&self, batch: Vec<(WebhookDelivery, String)>) -> DeliveryReport {
        let attempts = batch
            .into_iter()
            .map(|(delivery, token)| self.deliver(delivery, token));
        let results = futures::future::join_all(attempts).await;

        let mut report = DeliveryReport::default();
        for result in results {
            match result {
                Ok(DeliveryStatus::Delivered) => report.delivered += 1,
                Ok(DeliveryStatus::Failed) => report.failed += 1,
                Ok(_) => report.retrying += 1,
                Err(e) => warn!(error = %e, "webhook_outcome_not_recorded"),
            }
        }
        report
    }

    async fn deliver(&self, delivery: WebhookDelivery, token: String) -> Result<DeliveryStatus> {
        let webhook: Webhook = sqlx::query_as("SELECT * FROM webhooks WHERE id = ?")
            .bind(&delivery.webhook_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("webhook", &delivery.webhook_id))?;

        let attempt = self.post(&webhook, &delivery).await;
        self.record(&delivery, &token, &attempt).await
    }

    async fn post(&self, webhook: &Webhook, delivery: &WebhookDelivery) -> Attempt {
        let body = match serde_json::to_vec(&delivery.payload) {
            Ok(body) => body,
            Err(e) => {
                return Attempt::Failed {
                    status_code: None,
                    error: format!("payload not serializable: {e}"),
                }
            }
        };

        let mut request = self
            .client
            .post(&webhook.url)
            .header("content-type", "application/json")
            .header("x-webhook-event", &delivery.event_type)
            .header("x-webhook-delivery", &delivery.id);
        if let Some(secret) = webhook.secret_key.as_deref() {
            let timestamp = unix_now().to_string();
            if let Some(signature) = sign(secret, &body, &timestamp) {
                request = request
                    .header(TIMESTAMP_HEADER, timestamp)
                    .header(SIGNATURE_HEADER, signature);
            }
        }

        match request.body(body).send().await {
            Ok(resp) if resp.status().is_success() => Attempt::Delivered {
                status_code: resp.status().as_u16(),
            },
            Ok(resp) => Attempt::Failed {
                status_code: Some(resp.status().as_u16()),
                error: format!("subscriber returned HTTP {}", resp.status().as_u16()),
            },
            Err(e) => Attempt::Failed {
                status_code: None,
                error: if e.is_timeout() {
                    "subscriber timed out".to_string()
                } else {
                    format!("request failed: {e}")
                },
            },
        }
    }

    /// Record an attempt on the delivery and its webhook's counters.
    async fn record(
        &self,
        delivery: &WebhookDelivery,
        token: &str,
        attempt: &Attempt,
    ) -> Result<DeliveryStatus> {
        let attempts = delivery.attempts + 1;
        let now = db::now();

        let (status, status_code, last_error, next_retry_at) = match attempt {
            Attempt::Delivered { status_code } => {
                (DeliveryStatus::Delivered, Some(*status_code), None, None)
            }
            Attempt::Failed { status_code, error } => {
                if attempts >= i64::from(self.config.webhook_max_attempts) {
                    (DeliveryStatus::Failed, *status_code, Some(error.clone()), None)
                } else {
                    let attempt_no = u32::try_from(attempts).unwrap_or(u32::MAX);
                    let delay = backoff_delay(attempt_no, self.config.webhook_backoff_ms);
                    let at = now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                    (DeliveryStatus::Pending, *status_code, Some(error.clone()), Some(at))
                }
            }
        };

        let now_text = to_db(now);
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE webhook_deliveries SET status = ?1, attempts = ?2, last_status_code = ?3, \
             last_error = ?4, next_retry_at = ?5, lease_token = NULL, leased_at = NULL, \
             updated_at = ?6 \
             WHERE id = ?7 AND status = 'in_flight' AND lease_token = ?8",
        )
        .bind(status.as_str())
        .bind(attempts)
        .bind(status_code.map(i64::from))
        .bind(&last_error)
        .bind(next_retry_at.map(to_db))
        .bind(&now_text)
        .bind(&delivery.id)
        .bind(token)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::Conflict(format!(
                "delivery {} lease was lost before the outcome was recorded",
                delivery.id
            )));
        }

        let counter = if matches!(attempt, Attempt::Delivered { .. }) {
            "success_count"
        } else {
            "failure_count"
        };
        sqlx::query(&format!(
            "UPDATE webhooks SET {counter} = {counter} + 1, last_triggered_at = ?1 WHERE id = ?2"
        ))
        .bind(&now_text)
        .bind(&delivery.webhook_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        match (&status, attempt) {
            (DeliveryStatus::Delivered, _) => debug!(
                delivery_id = %delivery.id,
                webhook_id = %delivery.webhook_id,
                attempts = attempts,
                "webhook_delivered"
            ),
            (DeliveryStatus::Failed, Attempt::Failed { error, .. }) => warn!(
                delivery_id = %delivery.id,
                webhook_id = %delivery.webhook_id,
                attempts = attempts,
                error = %error,
                "webhook_delivery_failed"
            ),
            (_, Attempt::Failed { error, .. }) => info!(
                delivery_id = %delivery.id,
                webhook_id = %delivery.webhook_id,
                attempts = attempts,
                error = %error,
                "webhook_delivery_retry_scheduled"
            ),
            _ => {}
        }
        Ok(status)
    }
}
