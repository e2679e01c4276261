//! Status event publication.
//!
//! Publishing happens inside the transaction that changes a message's status:
//! the audit row in `message_events` and one pending `webhook_deliveries` row
//! per matching subscriber commit or roll back together with the status change.
//! Delivery itself is asynchronous (see [`crate::webhooks`]) and reads only
//! the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::db::{new_id, to_db};
use crate::error::Result;
use crate::model::Message;
use crate::status::MessageStatus;

/// Body of an outbound webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "event")]
    pub event_type: String,
    pub message_id: String,
    pub status: MessageStatus,
    pub previous_status: Option<MessageStatus>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip)]
    pub owner_id: String,
}

impl StatusEvent {
    /// Event for `message` having just entered its current status from `from`.
    /// `from` is `None` when the message was created in that status.
    pub fn for_message(message: &Message, from: Option<MessageStatus>, at: DateTime<Utc>) -> Self {
        let event_type = match from {
            Some(from) => message.status.event_type(from).to_string(),
            None => format!("message:{}", message.status),
        };
        StatusEvent {
            event_type,
            message_id: message.id.clone(),
            status: message.status,
            previous_status: from,
            timestamp: at,
            campaign_id: message.campaign_id.clone(),
            custom_id: message.custom_id.clone(),
            gateway_message_id: message.gateway_message_id.clone(),
            reason: message.reason.clone(),
            owner_id: message.owner_id.clone(),
        }
    }
}

/// Writes status events to the audit log and the webhook outbox.
#[derive(Debug, Clone, Default)]
pub struct EventBus;

impl EventBus {
    /// Append the audit row and enqueue webhook deliveries for `event`.
    ///
    /// Must run on the same connection (transaction) as the status change.
    /// Returns the number of deliveries created.
    pub async fn record(
        &self,
        conn: &mut SqliteConnection,
        event: &StatusEvent,
        payload: Option<&serde_json::Value>,
    ) -> Result<u64> {
        let at = to_db(event.timestamp);

        sqlx::query(
            "INSERT INTO message_events \
             (id, message_id, event_type, from_status, to_status, reason, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(new_id("mev"))
        .bind(&event.message_id)
        .bind(&event.event_type)
        .bind(event.previous_status.map(MessageStatus::as_str))
        .bind(event.status.as_str())
        .bind(&event.reason)
        .bind(payload.map(Json))
        .bind(&at)
        .execute(&mut *conn)
        .await?;

        let body = serde_json::to_string(event)?;
        let outbox = sqlx::query(
            "INSERT INTO webhook_deliveries \
             (id, webhook_id, message_id, event_type, payload, status, attempts, \
              next_retry_at, created_at, updated_at) \
             SELECT 'whd_' || lower(hex(randomblob(16))), w.id, ?1, ?2, ?3, 'pending', 0, \
                    ?4, ?4, ?4 \
             FROM webhooks w \
             WHERE w.owner_id = ?5 AND w.is_active = 1 \
               AND EXISTS (SELECT 1 FROM json_each(w.event_types) WHERE json_each.value = ?2)",
        )
        .bind(&event.message_id)
        .bind(&event.event_type)
        .bind(&body)
        .bind(&at)
        .bind(&event.owner_id)
        .execute(&mut *conn)
        .await?;

        let created = outbox.rows_affected();
        if created > 0 {
            debug!(
                message_id = %event.message_id,
                event_type = %event.event_type,
                deliveries = created,
                "webhook_deliveries_enqueued"
            );
        }
        Ok(created)
    }
}
