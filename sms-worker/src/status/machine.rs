//! Applies status transitions with compare-and-swap on the status column.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::db::{self, to_db, to_db_opt};
use crate::error::{Error, Result};
use crate::events::{EventBus, StatusEvent};
use crate::messages::{find_message, validate_content};
use crate::model::{Message, Variables};
use crate::status::MessageStatus;
use crate::template::render;
use crate::templates::usable_template;

/// Attempts at a transition when another writer moves the row first.
const CAS_RETRIES: usize = 3;

/// Rows examined per reaper pass.
const REAP_BATCH: i64 = 500;

/// Details recorded alongside a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub reason: Option<String>,
    pub gateway_id: Option<String>,
    /// Raw gateway or callback payload stored on the audit row.
    pub payload: Option<serde_json::Value>,
    /// Earliest time a re-queued message may be claimed again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub increment_attempts: bool,
    pub reset_attempts: bool,
    /// Apply only while the message still holds this claim.
    pub claim_token: Option<String>,
}

impl TransitionContext {
    pub fn reason(reason: impl Into<String>) -> Self {
        TransitionContext {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_claim(mut self, token: Option<&str>) -> Self {
        self.claim_token = token.map(str::to_string);
        self
    }
}

fn milestone_column(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Scheduled | MessageStatus::Queued => "queued_at",
        MessageStatus::Claimed => "claimed_at",
        MessageStatus::Processed => "processed_at",
        MessageStatus::Sent => "sent_at",
        MessageStatus::Delivered => "delivered_at",
        MessageStatus::Failed => "failed_at",
    }
}

/// The single writer of message status after creation.
#[derive(Clone)]
pub struct StatusMachine {
    pool: SqlitePool,
    bus: EventBus,
}

impl StatusMachine {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Move `message_id` to `to`, recording one event.
    ///
    /// Claiming is not available here; it only happens through the dispatch
    /// queue's batch claim.
    pub async fn transition(
        &self,
        message_id: &str,
        to: MessageStatus,
        ctx: TransitionContext,
    ) -> Result<Message> {
        for _ in 0..CAS_RETRIES {
            let current = find_message(&self.pool, message_id)
                .await?
                .ok_or_else(|| Error::not_found("message", message_id))?;
            check(&current, to, &ctx)?;

            let mut tx = self.pool.begin().await?;
            if let Some(message) = self.apply(&mut tx, &current, to, &ctx).await? {
                tx.commit().await?;
                return Ok(message);
            }
            tx.rollback().await?;
        }
        Err(Error::Conflict(format!(
            "message {message_id} kept changing; transition to {to} abandoned"
        )))
    }

    /// Compare-and-swap `current -> to` on `conn` and record the event.
    ///
    /// Returns `None` when the row no longer has `current.status` (or the
    /// claim in `ctx`). The caller owns the transaction.
    pub(crate) async fn apply(
        &self,
        conn: &mut SqliteConnection,
        current: &Message,
        to: MessageStatus,
        ctx: &TransitionContext,
    ) -> Result<Option<Message>> {
        let now = db::now();
        let sql = format!(
            "UPDATE messages SET status = ?1, previous_status = status, {milestone} = ?2, \
             updated_at = ?2, reason = COALESCE(?3, reason), \
             gateway_message_id = COALESCE(?4, gateway_message_id), next_attempt_at = ?5, \
             attempts = CASE WHEN ?6 THEN 0 ELSE attempts + ?7 END, claim_token = NULL \
             WHERE id = ?8 AND status = ?9 AND (?10 IS NULL OR claim_token = ?10) \
             RETURNING *",
            milestone = milestone_column(to)
        );

        let updated: Option<Message> = sqlx::query_as(&sql)
            .bind(to.as_str())
            .bind(to_db(now))
            .bind(&ctx.reason)
            .bind(&ctx.gateway_id)
            .bind(to_db_opt(ctx.next_attempt_at))
            .bind(ctx.reset_attempts)
            .bind(i64::from(ctx.increment_attempts))
            .bind(&current.id)
            .bind(current.status.as_str())
            .bind(&ctx.claim_token)
            .fetch_optional(&mut *conn)
            .await?;

        let Some(message) = updated else {
            return Ok(None);
        };

        let event = StatusEvent::for_message(&message, Some(current.status), now);
        self.bus.record(conn, &event, ctx.payload.as_ref()).await?;

        info!(
            message_id = %message.id,
            from = %current.status,
            to = %to,
            attempts = message.attempts,
            "message_status_changed"
        );
        Ok(Some(message))
    }

    /// Operator retry: move a failed message back to the queue with a fresh
    /// attempt budget.
    pub async fn retry_failed(&self, owner_id: &str, message_id: &str) -> Result<Message> {
        let current = find_message(&self.pool, message_id)
            .await?
            .filter(|m| m.owner_id == owner_id)
            .ok_or_else(|| Error::not_found("message", message_id))?;

        let ctx = TransitionContext {
            reason: Some("operator retry".to_string()),
            reset_attempts: true,
            ..Default::default()
        };
        check(&current, MessageStatus::Queued, &ctx)?;
        if current.status != MessageStatus::Failed {
            return Err(Error::InvalidTransition {
                from: current.status,
                to: MessageStatus::Queued,
            });
        }

        // Campaign messages that failed rendering have no content yet.
        let content = match (&current.content, &current.template_id) {
            (Some(_), _) => None,
            (None, Some(template_id)) => {
                Some(self.rerender(owner_id, template_id, &current).await?)
            }
            (None, None) => {
                return Err(Error::Conflict(format!(
                    "message {message_id} has no content to send"
                )))
            }
        };

        let mut tx = self.pool.begin().await?;
        if let Some(content) = &content {
            sqlx::query(
                "UPDATE messages SET content = ?1 \
                 WHERE id = ?2 AND status = 'failed' AND content IS NULL",
            )
            .bind(content)
            .bind(&current.id)
            .execute(&mut *tx)
            .await?;
        }
        let Some(message) = self
            .apply(&mut tx, &current, MessageStatus::Queued, &ctx)
            .await?
        else {
            tx.rollback().await?;
            return Err(Error::Conflict(format!(
                "message {message_id} changed while retrying"
            )));
        };

        if let Some(campaign_id) = &message.campaign_id {
            let (status,): (String,) = sqlx::query_as("SELECT status FROM campaigns WHERE id = ?")
                .bind(campaign_id)
                .fetch_one(&mut *tx)
                .await?;
            match status.as_str() {
                "cancelled" => {
                    tx.rollback().await?;
                    return Err(Error::Conflict(format!(
                        "campaign {campaign_id} is cancelled"
                    )));
                }
                // A finished campaign reopens so the retried message is claimable.
                "completed" => {
                    sqlx::query(
                        "UPDATE campaigns SET status = 'active', completed_at = NULL, \
                         updated_at = ?1 WHERE id = ?2 AND status = 'completed'",
                    )
                    .bind(to_db(db::now()))
                    .bind(campaign_id)
                    .execute(&mut *tx)
                    .await?;
                }
                _ => {}
            }
        }

        tx.commit().await?;
        Ok(message)
    }

    /// Render `message` from the current version of its template.
    ///
    /// Fails while variables are still missing or the result is not a valid
    /// body; the message then stays failed.
    async fn rerender(
        &self,
        owner_id: &str,
        template_id: &str,
        message: &Message,
    ) -> Result<String> {
        let template = {
            let mut conn = self.pool.acquire().await?;
            usable_template(&mut conn, owner_id, template_id).await?
        };
        let empty = Variables::new();
        let rendered = render(&template.content, message.variables.as_ref().unwrap_or(&empty));
        if !rendered.is_complete() {
            return Err(Error::validation(format!(
                "missing template variables: {}",
                rendered.missing.join(", ")
            )));
        }
        validate_content(&rendered.content)?;
        Ok(rendered.content)
    }

    /// Return claims older than `timeout` to the queue.
    ///
    /// Covers workers that died between claim and outcome. Returns the number
    /// of messages re-queued.
    pub async fn reap_stale_claims(&self, timeout: Duration) -> Result<u64> {
        let cutoff = db::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT id, claim_token FROM messages \
             WHERE status = 'claimed' AND claimed_at < ?1 ORDER BY claimed_at LIMIT ?2",
        )
        .bind(to_db(cutoff))
        .bind(REAP_BATCH)
        .fetch_all(&self.pool)
        .await?;

        let mut reaped = 0;
        for (id, token) in stale {
            let ctx = TransitionContext::reason("claim expired").with_claim(token.as_deref());
            match self.transition(&id, MessageStatus::Queued, ctx).await {
                Ok(_) => reaped += 1,
                // Finished or re-claimed since the scan.
                Err(Error::InvalidTransition { .. }) | Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if reaped > 0 {
            warn!(reaped = reaped, "stale_claims_requeued");
        }
        Ok(reaped)
    }
}

fn check(current: &Message, to: MessageStatus, ctx: &TransitionContext) -> Result<()> {
    if to == MessageStatus::Claimed || !current.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: current.status,
            to,
        });
    }
    if let Some(token) = &ctx.claim_token {
        if current.claim_token.as_deref() != Some(token.as_str()) {
            return Err(Error::Conflict(format!(
                "message {} is no longer held by this claim",
                current.id
            )));
        }
    }
    Ok(())
}
