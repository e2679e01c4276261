//! Webhook subscriptions and the delivery outbox.
//!
//! Deliveries are written by the event bus in the same transaction as the
//! status change that caused them; [`delivery::Notifier`] drains them
//! asynchronously in its own process.

pub mod delivery;
pub mod signature;

use serde::Deserialize;
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::{self, new_id, to_db};
use crate::error::{Error, Result};
use crate::model::{Webhook, WebhookDelivery};
use crate::status::EVENT_TYPES;

pub use delivery::Notifier;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWebhook {
    pub url: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
}

fn validate_url(raw: &str) -> Result<String> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| Error::validation(format!("invalid webhook url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::validation(
            "webhook url must be an absolute http(s) url",
        ));
    }
    Ok(url.to_string())
}

fn validate_event_types(requested: Vec<String>) -> Result<Vec<String>> {
    let mut events: Vec<String> = Vec::new();
    for event in requested {
        let event = event.trim().to_string();
        if !EVENT_TYPES.contains(&event.as_str()) {
            return Err(Error::validation(format!(
                "unknown event type '{event}'; expected one of: {}",
                EVENT_TYPES.join(", ")
            )));
        }
        if !events.contains(&event) {
            events.push(event);
        }
    }
    if events.is_empty() {
        return Err(Error::validation("at least one event type is required"));
    }
    Ok(events)
}

pub async fn create_webhook(pool: &SqlitePool, owner_id: &str, req: CreateWebhook) -> Result<Webhook> {
    let url = validate_url(&req.url)?;
    let events = validate_event_types(req.event_types)?;
    let secret = req.secret_key.filter(|s| !s.trim().is_empty());

    let webhook: Webhook = sqlx::query_as(
        "INSERT INTO webhooks (id, owner_id, url, event_types, secret_key, is_active, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6) RETURNING *",
    )
    .bind(new_id("whk"))
    .bind(owner_id)
    .bind(&url)
    .bind(Json(&events))
    .bind(&secret)
    .bind(to_db(db::now()))
    .fetch_one(pool)
    .await?;

    info!(
        webhook_id = %webhook.id,
        events = webhook.event_types.len(),
        signed = webhook.secret_key.is_some(),
        "webhook_created"
    );
    Ok(webhook)
}

pub async fn list_webhooks(pool: &SqlitePool, owner_id: &str) -> Result<Vec<Webhook>> {
    Ok(
        sqlx::query_as("SELECT * FROM webhooks WHERE owner_id = ? ORDER BY created_at, id")
            .bind(owner_id)
            .fetch_all(pool)
            .await?,
    )
}

/// Stop future deliveries to a webhook. Pending deliveries are still attempted.
pub async fn deactivate_webhook(pool: &SqlitePool, owner_id: &str, id: &str) -> Result<Webhook> {
    sqlx::query_as("UPDATE webhooks SET is_active = 0 WHERE id = ?1 AND owner_id = ?2 RETURNING *")
        .bind(id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("webhook", id))
}

/// Permanently failed deliveries of the owner's webhooks, newest first.
pub async fn list_failed_deliveries(
    pool: &SqlitePool,
    owner_id: &str,
    limit: u32,
) -> Result<Vec<WebhookDelivery>> {
    Ok(sqlx::query_as(
        "SELECT d.* FROM webhook_deliveries d JOIN webhooks w ON w.id = d.webhook_id \
         WHERE w.owner_id = ?1 AND d.status = 'failed' \
         ORDER BY d.updated_at DESC, d.id LIMIT ?2",
    )
    .bind(owner_id)
    .bind(i64::from(limit.clamp(1, 1000)))
    .fetch_all(pool)
    .await?)
}
