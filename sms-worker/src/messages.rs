//! Message creation, lookup and deletion.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::db::{self, new_id, to_db, to_db_opt};
use crate::error::{Error, Result};
use crate::events::{EventBus, StatusEvent};
use crate::model::{CampaignStatus, Message, MessageEvent, Variables};
use crate::phone;
use crate::status::MessageStatus;
use crate::template::render;
use crate::templates::usable_template;

/// Longest accepted message body (multi-part SMS).
pub const MAX_CONTENT_CHARS: usize = 1600;

pub fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::validation("message content cannot be empty"));
    }
    let chars = content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(Error::validation(format!(
            "message content is {chars} characters; the maximum is {MAX_CONTENT_CHARS}"
        )));
    }
    Ok(())
}

/// Column values for a message being created.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub owner_id: String,
    pub campaign_id: Option<String>,
    pub batch_id: Option<String>,
    pub import_id: Option<String>,
    pub template_id: Option<String>,
    pub variables: Option<Variables>,
    pub phone_number: String,
    pub content: Option<String>,
    pub custom_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    /// `scheduled` when the send time is still ahead, otherwise `queued`.
    pub fn initial_status(&self, now: DateTime<Utc>) -> MessageStatus {
        match self.scheduled_at {
            Some(at) if at > now => MessageStatus::Scheduled,
            _ => MessageStatus::Queued,
        }
    }
}

/// Insert one message and record its creation event on `conn`.
pub(crate) async fn insert_message(
    conn: &mut SqliteConnection,
    bus: &EventBus,
    new: &NewMessage,
    now: DateTime<Utc>,
) -> Result<Message> {
    let status = new.initial_status(now);
    let now_text = to_db(now);

    let message: Message = sqlx::query_as(
        "INSERT INTO messages (id, owner_id, campaign_id, batch_id, import_id, template_id, \
         variables, phone_number, content, status, custom_id, scheduled_at, queued_at, \
         created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, ?13) RETURNING *",
    )
    .bind(new_id("msg"))
    .bind(&new.owner_id)
    .bind(&new.campaign_id)
    .bind(&new.batch_id)
    .bind(&new.import_id)
    .bind(&new.template_id)
    .bind(new.variables.as_ref().map(Json))
    .bind(&new.phone_number)
    .bind(&new.content)
    .bind(status.as_str())
    .bind(&new.custom_id)
    .bind(to_db_opt(new.scheduled_at))
    .bind(&now_text)
    .fetch_one(&mut *conn)
    .await?;

    let event = StatusEvent::for_message(&message, None, now);
    bus.record(conn, &event, None).await?;
    Ok(message)
}

pub async fn find_message(pool: &SqlitePool, id: &str) -> Result<Option<Message>> {
    Ok(sqlx::query_as("SELECT * FROM messages WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

pub async fn get_message(pool: &SqlitePool, owner_id: &str, id: &str) -> Result<Message> {
    find_message(pool, id)
        .await?
        .filter(|m| m.owner_id == owner_id)
        .ok_or_else(|| Error::not_found("message", id))
}

/// Audit trail of a message, oldest first.
pub async fn message_events(pool: &SqlitePool, message_id: &str) -> Result<Vec<MessageEvent>> {
    Ok(sqlx::query_as(
        "SELECT * FROM message_events WHERE message_id = ? ORDER BY created_at, rowid",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?)
}

/// A single message sent outside any campaign.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectSend {
    pub phone_number: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub custom_id: Option<String>,
}

pub async fn send_direct(
    pool: &SqlitePool,
    bus: &EventBus,
    owner_id: &str,
    req: DirectSend,
) -> Result<Message> {
    let phone_number =
        phone::normalize(&req.phone_number).map_err(|e| Error::validation(e.to_string()))?;

    let (content, template_id, variables) = match (req.message, req.template_id) {
        (Some(_), Some(_)) => {
            return Err(Error::validation(
                "provide either message or template_id, not both",
            ))
        }
        (None, None) => return Err(Error::validation("message or template_id is required")),
        (Some(content), None) => (content, None, None),
        (None, Some(template_id)) => {
            let mut conn = pool.acquire().await?;
            let template = usable_template(&mut conn, owner_id, &template_id).await?;
            let mut variables = req.variables;
            variables
                .entry("phone".to_string())
                .or_insert_with(|| phone_number.clone());
            let rendered = render(&template.content, &variables);
            if !rendered.is_complete() {
                return Err(Error::validation(format!(
                    "missing template variables: {}",
                    rendered.missing.join(", ")
                )));
            }
            (rendered.content, Some(template_id), Some(variables))
        }
    };
    validate_content(&content)?;

    let new = NewMessage {
        owner_id: owner_id.to_string(),
        template_id,
        variables,
        phone_number,
        content: Some(content),
        custom_id: req.custom_id,
        scheduled_at: req.scheduled_at,
        ..Default::default()
    };
    let mut tx = pool.begin().await?;
    let message = insert_message(&mut tx, bus, &new, db::now()).await?;
    tx.commit().await?;

    info!(
        message_id = %message.id,
        status = %message.status,
        templated = message.template_id.is_some(),
        "direct_message_created"
    );
    Ok(message)
}

/// Delete a message once it no longer belongs to a running campaign.
pub async fn delete_message(pool: &SqlitePool, owner_id: &str, id: &str) -> Result<()> {
    let message = get_message(pool, owner_id, id).await?;
    if message.status == MessageStatus::Claimed {
        return Err(Error::Conflict(format!("message {id} is being dispatched")));
    }
    if let Some(campaign_id) = &message.campaign_id {
        let (status,): (String,) = sqlx::query_as("SELECT status FROM campaigns WHERE id = ?")
            .bind(campaign_id)
            .fetch_one(pool)
            .await?;
        let open = status
            .parse::<CampaignStatus>()
            .map(CampaignStatus::is_open)
            .unwrap_or(true);
        if open {
            return Err(Error::Conflict(format!(
                "message {id} belongs to campaign {campaign_id}, which is still {status}"
            )));
        }
    }

    let deleted = sqlx::query("DELETE FROM messages WHERE id = ?1 AND owner_id = ?2 AND status <> 'claimed'")
        .bind(id)
        .bind(owner_id)
        .execute(pool)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(Error::Conflict(format!("message {id} changed during deletion")));
    }
    info!(message_id = %id, "message_deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_temp;
    use crate::templates::create_template;

    fn direct(message: Option<&str>, template_id: Option<&str>) -> DirectSend {
        DirectSend {
            phone_number: "+1 415 555 2671".to_string(),
            message: message.map(str::to_string),
            template_id: template_id.map(str::to_string),
            variables: Variables::new(),
            scheduled_at: None,
            custom_id: Some("client-7".to_string()),
        }
    }

    #[tokio::test]
    async fn test_send_direct_queues_with_normalized_phone() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let msg = send_direct(db.pool(), &bus, "o", direct(Some("hello"), None))
            .await
            .unwrap();

        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.phone_number, "+14155552671");
        assert_eq!(msg.custom_id.as_deref(), Some("client-7"));

        let events = message_events(db.pool(), &msg.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "message:queued");
        assert_eq!(events[0].from_status, None);
    }

    #[tokio::test]
    async fn test_send_direct_future_time_is_scheduled() {
        let (_dir, db) = open_temp().await;
        let mut req = direct(Some("later"), None);
        req.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        let msg = send_direct(db.pool(), &EventBus::default(), "o", req)
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_send_direct_requires_exactly_one_source() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        assert!(matches!(
            send_direct(db.pool(), &bus, "o", direct(Some("x"), Some("tpl_1"))).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            send_direct(db.pool(), &bus, "o", direct(None, None)).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_direct_renders_template() {
        let (_dir, db) = open_temp().await;
        let t = create_template(db.pool(), "o", "t", "Hi {{name}} at {{phone}}")
            .await
            .unwrap();

        let mut req = direct(None, Some(&t.id));
        req.variables.insert("name".to_string(), "Ann".to_string());
        let msg = send_direct(db.pool(), &EventBus::default(), "o", req)
            .await
            .unwrap();
        assert_eq!(msg.content.as_deref(), Some("Hi Ann at +14155552671"));

        let req = direct(None, Some(&t.id));
        let err = send_direct(db.pool(), &EventBus::default(), "o", req)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[tokio::test]
    async fn test_send_direct_rejects_bad_phone_and_long_content() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let mut req = direct(Some("hi"), None);
        req.phone_number = "call me".to_string();
        assert!(matches!(
            send_direct(db.pool(), &bus, "o", req).await,
            Err(Error::Validation(_))
        ));

        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            send_direct(db.pool(), &bus, "o", direct(Some(&long), None)).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_standalone_message() {
        let (_dir, db) = open_temp().await;
        let msg = send_direct(db.pool(), &EventBus::default(), "o", direct(Some("x"), None))
            .await
            .unwrap();

        assert!(matches!(
            delete_message(db.pool(), "other", &msg.id).await,
            Err(Error::NotFound { .. })
        ));
        delete_message(db.pool(), "o", &msg.id).await.unwrap();
        assert!(find_message(db.pool(), &msg.id).await.unwrap().is_none());
    }
}
