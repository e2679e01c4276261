//! Row decoding for the entity types.
//!
//! Timestamps and enums are stored as text and parsed here; JSON columns go
//! through `sqlx::types::Json`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{FromRow, Row};

use super::from_db;
use crate::model::{
    Campaign, Contact, ImportJob, Message, MessageEvent, MessageTemplate, RowError, Variables,
    Webhook, WebhookDelivery,
};

fn decode_error(column: &str, err: impl Into<sqlx::error::BoxDynError>) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: err.into(),
    }
}

fn ts(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    from_db(&raw).map_err(|e| decode_error(column, e))
}

fn opt_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| from_db(&raw).map_err(|e| decode_error(column, e)))
        .transpose()
}

fn text_enum<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: String| decode_error(column, e))
}

fn opt_text_enum<T: FromStr<Err = String>>(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<T>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| raw.parse().map_err(|e: String| decode_error(column, e)))
        .transpose()
}

impl FromRow<'_, SqliteRow> for ImportJob {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let Json(errors): Json<Vec<RowError>> = row.try_get("errors")?;
        Ok(ImportJob {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            filename: row.try_get("filename")?,
            content_hash: row.try_get("content_hash")?,
            size_bytes: row.try_get("size_bytes")?,
            status: text_enum(row, "status")?,
            rows_seen: row.try_get("rows_seen")?,
            rows_inserted: row.try_get("rows_inserted")?,
            rows_rejected: row.try_get("rows_rejected")?,
            errors,
            failure_kind: opt_text_enum(row, "failure_kind")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: ts(row, "created_at")?,
            completed_at: opt_ts(row, "completed_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for Contact {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let Json(tags): Json<Vec<String>> = row.try_get("tags")?;
        let Json(variables): Json<Variables> = row.try_get("variables")?;
        Ok(Contact {
            id: row.try_get("id")?,
            import_id: row.try_get("import_id")?,
            row_index: row.try_get("row_index")?,
            phone: row.try_get("phone")?,
            name: row.try_get("name")?,
            tags,
            variables,
            created_at: ts(row, "created_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for MessageTemplate {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let Json(variables): Json<Vec<String>> = row.try_get("variables")?;
        Ok(MessageTemplate {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            content: row.try_get("content")?,
            variables,
            is_active: row.try_get("is_active")?,
            created_at: ts(row, "created_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for Campaign {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Campaign {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            message_content: row.try_get("message_content")?,
            template_id: row.try_get("template_id")?,
            import_id: row.try_get("import_id")?,
            batch_id: row.try_get("batch_id")?,
            status: text_enum(row, "status")?,
            total_messages: row.try_get("total_messages")?,
            scheduled_start_at: opt_ts(row, "scheduled_start_at")?,
            scheduled_end_at: opt_ts(row, "scheduled_end_at")?,
            started_at: opt_ts(row, "started_at")?,
            completed_at: opt_ts(row, "completed_at")?,
            created_at: ts(row, "created_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for Message {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let variables: Option<Json<Variables>> = row.try_get("variables")?;
        Ok(Message {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            campaign_id: row.try_get("campaign_id")?,
            batch_id: row.try_get("batch_id")?,
            import_id: row.try_get("import_id")?,
            template_id: row.try_get("template_id")?,
            variables: variables.map(|Json(v)| v),
            phone_number: row.try_get("phone_number")?,
            content: row.try_get("content")?,
            status: text_enum(row, "status")?,
            previous_status: opt_text_enum(row, "previous_status")?,
            custom_id: row.try_get("custom_id")?,
            scheduled_at: opt_ts(row, "scheduled_at")?,
            next_attempt_at: opt_ts(row, "next_attempt_at")?,
            attempts: row.try_get("attempts")?,
            claim_token: row.try_get("claim_token")?,
            claimed_by: row.try_get("claimed_by")?,
            gateway_message_id: row.try_get("gateway_message_id")?,
            reason: row.try_get("reason")?,
            queued_at: opt_ts(row, "queued_at")?,
            claimed_at: opt_ts(row, "claimed_at")?,
            processed_at: opt_ts(row, "processed_at")?,
            sent_at: opt_ts(row, "sent_at")?,
            delivered_at: opt_ts(row, "delivered_at")?,
            failed_at: opt_ts(row, "failed_at")?,
            created_at: ts(row, "created_at")?,
            updated_at: ts(row, "updated_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for MessageEvent {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let payload: Option<Json<serde_json::Value>> = row.try_get("payload")?;
        Ok(MessageEvent {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            event_type: row.try_get("event_type")?,
            from_status: opt_text_enum(row, "from_status")?,
            to_status: text_enum(row, "to_status")?,
            reason: row.try_get("reason")?,
            payload: payload.map(|Json(v)| v),
            created_at: ts(row, "created_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for Webhook {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let Json(event_types): Json<Vec<String>> = row.try_get("event_types")?;
        Ok(Webhook {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            url: row.try_get("url")?,
            event_types,
            secret_key: row.try_get("secret_key")?,
            is_active: row.try_get("is_active")?,
            success_count: row.try_get("success_count")?,
            failure_count: row.try_get("failure_count")?,
            last_triggered_at: opt_ts(row, "last_triggered_at")?,
            created_at: ts(row, "created_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for WebhookDelivery {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;
        Ok(WebhookDelivery {
            id: row.try_get("id")?,
            webhook_id: row.try_get("webhook_id")?,
            message_id: row.try_get("message_id")?,
            event_type: row.try_get("event_type")?,
            payload,
            status: text_enum(row, "status")?,
            attempts: row.try_get("attempts")?,
            last_status_code: row.try_get("last_status_code")?,
            last_error: row.try_get("last_error")?,
            next_retry_at: opt_ts(row, "next_retry_at")?,
            created_at: ts(row, "created_at")?,
            updated_at: ts(row, "updated_at")?,
        })
    }
}
