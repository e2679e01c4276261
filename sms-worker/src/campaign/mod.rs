//! Campaigns: creation with materialization, lifecycle and progress.
//!
//! A campaign is materialized when it is created: every recipient becomes a
//! message row tagged with the campaign's `batch_id`, all in one transaction.
//! Messages are only claimable while the campaign is `active`, so a draft can
//! sit fully materialized without the dispatcher touching it. Template
//! campaigns get their content rendered per message when they start.

mod materializer;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::{self, new_id, to_db, to_db_opt};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::messages::validate_content;
use crate::model::{Campaign, CampaignStatus, ImportStatus, Variables};
use crate::phone;
use crate::status::{MessageStatus, StatusMachine};
use crate::templates::usable_template;

pub use materializer::refresh_completion;
use materializer::{Source, Target};

/// One inline recipient.
#[derive(Debug, Clone, Deserialize)]
pub struct Recipient {
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variables: Variables,
}

/// Where a campaign's recipients come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Recipients {
    Inline { contacts: Vec<Recipient> },
    Import { import_id: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaign {
    pub name: String,
    #[serde(default)]
    pub message_content: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    pub recipients: Recipients,
    #[serde(default)]
    pub scheduled_start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_end_at: Option<DateTime<Utc>>,
}

/// Message counts for a campaign or batch. Every status is present.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Progress {
    pub campaign_id: String,
    pub batch_id: String,
    pub campaign_status: CampaignStatus,
    pub total: i64,
    pub counts: BTreeMap<MessageStatus, i64>,
}

/// Normalize inline recipients, dropping repeated phones after the first.
fn validate_inline(contacts: Vec<Recipient>) -> Result<Vec<Target>> {
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(contacts.len());
    for (i, contact) in contacts.into_iter().enumerate() {
        let phone = phone::normalize(&contact.phone)
            .map_err(|e| Error::validation(format!("recipient {}: {e}", i + 1)))?;
        if !seen.insert(phone.clone()) {
            continue;
        }
        targets.push(Target {
            phone,
            name: contact.name.filter(|n| !n.trim().is_empty()),
            variables: contact.variables,
        });
    }
    if targets.is_empty() {
        return Err(Error::validation("campaign has no recipients"));
    }
    Ok(targets)
}

/// Validate `req`, create the campaign in `draft` and materialize its messages.
pub async fn create_campaign(
    pool: &SqlitePool,
    bus: &EventBus,
    owner_id: &str,
    req: CreateCampaign,
) -> Result<Campaign> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::validation("campaign name is required"));
    }
    match (&req.message_content, &req.template_id) {
        (Some(_), Some(_)) => {
            return Err(Error::validation(
                "provide either message_content or template_id, not both",
            ))
        }
        (None, None) => {
            return Err(Error::validation(
                "message_content or template_id is required",
            ))
        }
        (Some(content), None) => validate_content(content)?,
        (None, Some(_)) => {}
    }
    if let (Some(start), Some(end)) = (req.scheduled_start_at, req.scheduled_end_at) {
        if end <= start {
            return Err(Error::validation(
                "scheduled_end_at must be after scheduled_start_at",
            ));
        }
    }

    // Reads happen before the write transaction opens.
    let (targets, import_id) = match req.recipients {
        Recipients::Inline { contacts } => (validate_inline(contacts)?, None),
        Recipients::Import { import_id } => {
            let job: Option<(String, String)> =
                sqlx::query_as("SELECT owner_id, status FROM import_jobs WHERE id = ?")
                    .bind(&import_id)
                    .fetch_optional(pool)
                    .await?;
            match job {
                Some((owner, status)) if owner == owner_id => {
                    if status != ImportStatus::Success.as_str() {
                        return Err(Error::validation(format!(
                            "import {import_id} is {status}; only successful imports can be used"
                        )));
                    }
                }
                _ => return Err(Error::not_found("import", import_id)),
            }
            (Vec::new(), Some(import_id))
        }
    };
    if let Some(template_id) = &req.template_id {
        let mut conn = pool.acquire().await?;
        usable_template(&mut conn, owner_id, template_id).await?;
    }

    let now = db::now();
    let now_text = to_db(now);
    let mut tx = pool.begin().await?;
    let campaign: Campaign = sqlx::query_as(
        "INSERT INTO campaigns (id, owner_id, name, message_content, template_id, import_id, \
         batch_id, status, total_messages, scheduled_start_at, scheduled_end_at, \
         created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'draft', 0, ?8, ?9, ?10, ?10) RETURNING *",
    )
    .bind(new_id("cmp"))
    .bind(owner_id)
    .bind(&name)
    .bind(&req.message_content)
    .bind(&req.template_id)
    .bind(&import_id)
    .bind(new_id("bat"))
    .bind(to_db_opt(req.scheduled_start_at))
    .bind(to_db_opt(req.scheduled_end_at))
    .bind(&now_text)
    .fetch_one(&mut *tx)
    .await?;

    let source = match &import_id {
        Some(id) => Source::Import(id),
        None => Source::Inline(&targets),
    };
    let total = materializer::materialize(&mut tx, bus, &campaign, source, now).await?;
    if total == 0 {
        tx.rollback().await?;
        return Err(Error::validation("campaign has no recipients"));
    }
    tx.commit().await?;

    info!(
        campaign_id = %campaign.id,
        batch_id = %campaign.batch_id,
        messages = total,
        templated = campaign.template_id.is_some(),
        "campaign_created"
    );
    Ok(Campaign {
        total_messages: total,
        ..campaign
    })
}

pub async fn get_campaign(pool: &SqlitePool, owner_id: &str, id: &str) -> Result<Campaign> {
    sqlx::query_as("SELECT * FROM campaigns WHERE id = ?1 AND owner_id = ?2")
        .bind(id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("campaign", id))
}

/// Compare-and-swap the campaign status; `Conflict` when it is in none of `from`.
async fn move_campaign(
    pool: &SqlitePool,
    campaign: &Campaign,
    from: &[CampaignStatus],
    to: CampaignStatus,
) -> Result<Campaign> {
    let now = to_db(db::now());
    let from_list = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE campaigns SET status = ?1, updated_at = ?2, \
         started_at = CASE WHEN ?1 = 'active' THEN COALESCE(started_at, ?2) ELSE started_at END, \
         completed_at = CASE WHEN ?1 IN ('completed', 'cancelled') THEN ?2 ELSE completed_at END \
         WHERE id = ?3 AND status IN ({from_list}) RETURNING *"
    );

    let moved: Option<Campaign> = sqlx::query_as(&sql)
        .bind(to.as_str())
        .bind(&now)
        .bind(&campaign.id)
        .fetch_optional(pool)
        .await?;

    let moved = moved.ok_or_else(|| {
        Error::Conflict(format!(
            "campaign {} is {} and cannot become {}",
            campaign.id, campaign.status, to
        ))
    })?;
    info!(
        campaign_id = %moved.id,
        from = %campaign.status,
        to = %to,
        "campaign_status_changed"
    );
    Ok(moved)
}

/// Start (or resume) a campaign so its messages become claimable.
///
/// Template content is rendered before the status flips, so the first claim
/// already sees rendered messages.
pub async fn start_campaign(
    machine: &StatusMachine,
    owner_id: &str,
    id: &str,
) -> Result<Campaign> {
    let pool = machine.pool();
    let campaign = get_campaign(pool, owner_id, id).await?;
    if !matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Paused) {
        return Err(Error::Conflict(format!(
            "campaign {id} is {} and cannot be started",
            campaign.status
        )));
    }
    if campaign
        .scheduled_end_at
        .is_some_and(|end| end <= db::now())
    {
        return Err(Error::validation(format!(
            "campaign {id} scheduling window has already ended"
        )));
    }

    if let Some(template_id) = &campaign.template_id {
        let template = {
            let mut conn = pool.acquire().await?;
            usable_template(&mut conn, owner_id, template_id).await?
        };
        materializer::render_pending(machine, &campaign.id, &template).await?;
    }

    let started = move_campaign(
        pool,
        &campaign,
        &[CampaignStatus::Draft, CampaignStatus::Paused],
        CampaignStatus::Active,
    )
    .await?;

    // Every message may have failed rendering.
    refresh_completion(pool, &BTreeSet::from([started.id.clone()])).await?;
    get_campaign(pool, owner_id, id).await
}

/// Stop claiming new messages. In-flight sends finish normally.
pub async fn pause_campaign(pool: &SqlitePool, owner_id: &str, id: &str) -> Result<Campaign> {
    let campaign = get_campaign(pool, owner_id, id).await?;
    move_campaign(pool, &campaign, &[CampaignStatus::Active], CampaignStatus::Paused).await
}

/// Cancel a campaign and fail every message that has not been claimed.
pub async fn cancel_campaign(
    machine: &StatusMachine,
    owner_id: &str,
    id: &str,
) -> Result<Campaign> {
    let campaign = get_campaign(machine.pool(), owner_id, id).await?;
    let cancelled = move_campaign(
        machine.pool(),
        &campaign,
        &[
            CampaignStatus::Draft,
            CampaignStatus::Active,
            CampaignStatus::Paused,
        ],
        CampaignStatus::Cancelled,
    )
    .await?;

    let failed = materializer::fail_unsent(machine, &cancelled.id, "campaign cancelled").await?;
    info!(campaign_id = %cancelled.id, failed = failed, "campaign_cancelled");
    Ok(cancelled)
}

async fn progress_for(pool: &SqlitePool, campaign: Campaign) -> Result<Progress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM messages WHERE batch_id = ? GROUP BY status",
    )
    .bind(&campaign.batch_id)
    .fetch_all(pool)
    .await?;

    let mut counts: BTreeMap<MessageStatus, i64> =
        MessageStatus::ALL.iter().map(|s| (*s, 0)).collect();
    let mut total = 0;
    for (status, n) in rows {
        let status: MessageStatus = status.parse().map_err(Error::validation)?;
        counts.insert(status, n);
        total += n;
    }

    Ok(Progress {
        campaign_id: campaign.id,
        batch_id: campaign.batch_id,
        campaign_status: campaign.status,
        total,
        counts,
    })
}

/// Message counts by status for a campaign.
pub async fn campaign_status(pool: &SqlitePool, owner_id: &str, id: &str) -> Result<Progress> {
    let campaign = get_campaign(pool, owner_id, id).await?;
    progress_for(pool, campaign).await
}

/// Message counts by status for a materialization batch, looked up by batch id.
pub async fn batch_progress(pool: &SqlitePool, owner_id: &str, batch_id: &str) -> Result<Progress> {
    let campaign: Campaign =
        sqlx::query_as("SELECT * FROM campaigns WHERE batch_id = ?1 AND owner_id = ?2")
            .bind(batch_id)
            .bind(owner_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::not_found("batch", batch_id))?;
    progress_for(pool, campaign).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_temp;
    use crate::dispatch::DispatchQueue;
    use crate::messages::{find_message, MAX_CONTENT_CHARS};
    use crate::model::Message;
    use crate::templates::{create_template, deactivate_template};

    fn inline(phones: &[&str]) -> Recipients {
        Recipients::Inline {
            contacts: phones
                .iter()
                .map(|p| Recipient {
                    phone: p.to_string(),
                    name: None,
                    variables: Variables::new(),
                })
                .collect(),
        }
    }

    fn literal(phones: &[&str]) -> CreateCampaign {
        CreateCampaign {
            name: "spring".to_string(),
            message_content: Some("Sale starts now".to_string()),
            template_id: None,
            recipients: inline(phones),
            scheduled_start_at: None,
            scheduled_end_at: None,
        }
    }

    async fn messages_of(pool: &SqlitePool, campaign_id: &str) -> Vec<Message> {
        sqlx::query_as("SELECT * FROM messages WHERE campaign_id = ? ORDER BY phone_number")
            .bind(campaign_id)
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_content_source_must_be_exactly_one() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let template = create_template(db.pool(), "o", "t", "Hi").await.unwrap();

        let mut both = literal(&["+15550000001"]);
        both.template_id = Some(template.id.clone());
        let err = create_campaign(db.pool(), &bus, "o", both).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut neither = literal(&["+15550000001"]);
        neither.message_content = None;
        let err = create_campaign(db.pool(), &bus, "o", neither).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let campaign = create_campaign(db.pool(), &bus, "o", literal(&["+15550000001"]))
            .await
            .unwrap();
        assert_eq!(campaign.status, CampaignStatus::Draft);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM campaigns")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_unusable_template_is_rejected() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let template = create_template(db.pool(), "o", "t", "Hi {{name}}").await.unwrap();
        deactivate_template(db.pool(), "o", &template.id).await.unwrap();

        let mut req = literal(&["+15550000001"]);
        req.message_content = None;
        req.template_id = Some(template.id.clone());
        let err = create_campaign(db.pool(), &bus, "o", req.clone()).await.unwrap_err();
        assert!(matches!(err, Error::TemplateNotUsable { .. }));

        let err = create_campaign(db.pool(), &bus, "other", req).await.unwrap_err();
        assert!(matches!(err, Error::TemplateNotUsable { .. }));
    }

    #[tokio::test]
    async fn test_materializes_one_message_per_unique_recipient() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let campaign = create_campaign(
            db.pool(),
            &bus,
            "o",
            literal(&["+15550000001", "+1 555 000 0002", "+15550000001"]),
        )
        .await
        .unwrap();

        assert_eq!(campaign.total_messages, 2);
        assert_ne!(campaign.batch_id, campaign.id);
        let messages = messages_of(db.pool(), &campaign.id).await;
        assert_eq!(messages.len(), 2);
        for m in &messages {
            assert_eq!(m.status, MessageStatus::Queued);
            assert_eq!(m.batch_id.as_deref(), Some(campaign.batch_id.as_str()));
            assert_eq!(m.content.as_deref(), Some("Sale starts now"));
            assert!(m.variables.is_none());
        }

        // Draft campaigns are not claimable.
        let queue = DispatchQueue::new(db.pool().clone(), bus);
        assert!(queue.claim_batch("w", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_inline_phone_creates_nothing() {
        let (_dir, db) = open_temp().await;
        let err = create_campaign(
            db.pool(),
            &EventBus::default(),
            "o",
            literal(&["+15550000001", "call me"]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_start_renders_and_fails_incomplete_messages() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let machine = StatusMachine::new(db.pool().clone(), bus.clone());
        let template = create_template(db.pool(), "o", "t", "Hi {{name}}, order {{order_no}}")
            .await
            .unwrap();

        let recipients = Recipients::Inline {
            contacts: vec![
                Recipient {
                    phone: "+15550000001".to_string(),
                    name: Some("Ana".to_string()),
                    variables: Variables::from([("order_no".to_string(), "17".to_string())]),
                },
                Recipient {
                    phone: "+15550000002".to_string(),
                    name: Some("Bo".to_string()),
                    variables: Variables::new(),
                },
            ],
        };
        let campaign = create_campaign(
            db.pool(),
            &bus,
            "o",
            CreateCampaign {
                name: "orders".to_string(),
                message_content: None,
                template_id: Some(template.id.clone()),
                recipients,
                scheduled_start_at: None,
                scheduled_end_at: None,
            },
        )
        .await
        .unwrap();

        let before = messages_of(db.pool(), &campaign.id).await;
        assert!(before.iter().all(|m| m.content.is_none()));
        assert_eq!(
            before[0].variables.as_ref().unwrap().get("phone").map(String::as_str),
            Some("+15550000001")
        );

        let started = start_campaign(&machine, "o", &campaign.id).await.unwrap();
        assert_eq!(started.status, CampaignStatus::Active);
        assert!(started.started_at.is_some());

        let after = messages_of(db.pool(), &campaign.id).await;
        assert_eq!(after[0].content.as_deref(), Some("Hi Ana, order 17"));
        assert_eq!(after[0].status, MessageStatus::Queued);
        assert_eq!(after[1].status, MessageStatus::Failed);
        assert_eq!(
            after[1].reason.as_deref(),
            Some("missing template variables: order_no")
        );
    }

    async fn template_campaign(
        db: &crate::db::Database,
        bus: &EventBus,
        content: &str,
        variables: Variables,
    ) -> Campaign {
        let template = create_template(db.pool(), "o", "t", content).await.unwrap();
        create_campaign(
            db.pool(),
            bus,
            "o",
            CreateCampaign {
                name: "codes".to_string(),
                message_content: None,
                template_id: Some(template.id),
                recipients: Recipients::Inline {
                    contacts: vec![Recipient {
                        phone: "+15550000001".to_string(),
                        name: None,
                        variables,
                    }],
                },
                scheduled_start_at: None,
                scheduled_end_at: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_overlong_rendered_content_fails_message() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let machine = StatusMachine::new(db.pool().clone(), bus.clone());
        let body = "x".repeat(MAX_CONTENT_CHARS + 1);
        let campaign = template_campaign(
            &db,
            &bus,
            "{{body}}",
            Variables::from([("body".to_string(), body)]),
        )
        .await;

        let started = start_campaign(&machine, "o", &campaign.id).await.unwrap();
        assert_eq!(started.status, CampaignStatus::Completed);

        let message = &messages_of(db.pool(), &campaign.id).await[0];
        assert_eq!(message.status, MessageStatus::Failed);
        assert!(message.content.is_none());
        let reason = message.reason.as_deref().unwrap();
        assert!(reason.contains("the maximum is 1600"), "{reason}");
    }

    #[tokio::test]
    async fn test_retry_rerenders_unrendered_campaign_message() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let machine = StatusMachine::new(db.pool().clone(), bus.clone());
        let queue = DispatchQueue::new(db.pool().clone(), bus.clone());
        let campaign = template_campaign(&db, &bus, "Code {{code}}", Variables::new()).await;

        let started = start_campaign(&machine, "o", &campaign.id).await.unwrap();
        assert_eq!(started.status, CampaignStatus::Completed);
        let failed = messages_of(db.pool(), &campaign.id).await.remove(0);
        assert_eq!(failed.status, MessageStatus::Failed);
        assert!(failed.content.is_none());

        // Still missing `code`: the retry is refused and nothing moves.
        assert!(matches!(
            machine.retry_failed("o", &failed.id).await,
            Err(Error::Validation(_))
        ));
        let unchanged = find_message(db.pool(), &failed.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, MessageStatus::Failed);
        assert!(unchanged.content.is_none());
        assert_eq!(
            get_campaign(db.pool(), "o", &campaign.id).await.unwrap().status,
            CampaignStatus::Completed
        );

        sqlx::query("UPDATE messages SET variables = ?1 WHERE id = ?2")
            .bind(r#"{"code":"42"}"#)
            .bind(&failed.id)
            .execute(db.pool())
            .await
            .unwrap();
        let retried = machine.retry_failed("o", &failed.id).await.unwrap();
        assert_eq!(retried.status, MessageStatus::Queued);
        assert_eq!(retried.content.as_deref(), Some("Code 42"));
        assert_eq!(
            get_campaign(db.pool(), "o", &campaign.id).await.unwrap().status,
            CampaignStatus::Active
        );

        let claimed = queue.claim_batch("w", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, failed.id);
        assert_eq!(claimed[0].content.as_deref(), Some("Code 42"));
    }

    #[tokio::test]
    async fn test_lifecycle_gates_claims() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let machine = StatusMachine::new(db.pool().clone(), bus.clone());
        let queue = DispatchQueue::new(db.pool().clone(), bus.clone());
        let campaign = create_campaign(
            db.pool(),
            &bus,
            "o",
            literal(&["+15550000001", "+15550000002"]),
        )
        .await
        .unwrap();

        assert!(matches!(
            pause_campaign(db.pool(), "o", &campaign.id).await,
            Err(Error::Conflict(_))
        ));
        start_campaign(&machine, "o", &campaign.id).await.unwrap();
        pause_campaign(db.pool(), "o", &campaign.id).await.unwrap();
        assert!(queue.claim_batch("w", 10).await.unwrap().is_empty());

        start_campaign(&machine, "o", &campaign.id).await.unwrap();
        assert_eq!(queue.claim_batch("w", 1).await.unwrap().len(), 1);

        let cancelled = cancel_campaign(&machine, "o", &campaign.id).await.unwrap();
        assert_eq!(cancelled.status, CampaignStatus::Cancelled);
        let progress = campaign_status(db.pool(), "o", &campaign.id).await.unwrap();
        assert_eq!(progress.counts[&MessageStatus::Claimed], 1);
        assert_eq!(progress.counts[&MessageStatus::Failed], 1);
        assert_eq!(progress.counts[&MessageStatus::Queued], 0);
        assert_eq!(progress.total, 2);
    }

    #[tokio::test]
    async fn test_completion_and_batch_progress() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let machine = StatusMachine::new(db.pool().clone(), bus.clone());
        let campaign = create_campaign(db.pool(), &bus, "o", literal(&["+15550000001"]))
            .await
            .unwrap();
        start_campaign(&machine, "o", &campaign.id).await.unwrap();

        let ids = BTreeSet::from([campaign.id.clone()]);
        refresh_completion(db.pool(), &ids).await.unwrap();
        assert_eq!(
            get_campaign(db.pool(), "o", &campaign.id).await.unwrap().status,
            CampaignStatus::Active
        );

        let message = &messages_of(db.pool(), &campaign.id).await[0];
        sqlx::query("UPDATE messages SET status = 'processed' WHERE id = ?")
            .bind(&message.id)
            .execute(db.pool())
            .await
            .unwrap();
        refresh_completion(db.pool(), &ids).await.unwrap();
        let done = get_campaign(db.pool(), "o", &campaign.id).await.unwrap();
        assert_eq!(done.status, CampaignStatus::Completed);
        assert!(done.completed_at.is_some());

        let progress = batch_progress(db.pool(), "o", &campaign.batch_id).await.unwrap();
        assert_eq!(progress.campaign_id, campaign.id);
        assert_eq!(progress.counts[&MessageStatus::Processed], 1);
        assert!(matches!(
            batch_progress(db.pool(), "o", &campaign.id).await,
            Err(Error::NotFound { .. })
        ));

        let processed = find_message(db.pool(), &message.id).await.unwrap().unwrap();
        assert_eq!(processed.status, MessageStatus::Processed);
    }

    #[tokio::test]
    async fn test_materializes_from_import_contacts() {
        let (_dir, db) = open_temp().await;
        let bus = EventBus::default();
        let now = to_db(db::now());
        sqlx::query(
            "INSERT INTO import_jobs (id, owner_id, filename, status, created_at) \
             VALUES ('imp_1', 'o', 'c.csv', 'success', ?1)",
        )
        .bind(&now)
        .execute(db.pool())
        .await
        .unwrap();
        for (i, phone) in ["+15550000001", "+15550000002", "+15550000003"].iter().enumerate() {
            sqlx::query(
                "INSERT INTO contacts (id, import_id, row_index, phone, name, variables, created_at) \
                 VALUES (?1, 'imp_1', ?2, ?3, 'Ana', '{\"city\":\"Lima\"}', ?4)",
            )
            .bind(new_id("con"))
            .bind(i as i64 + 1)
            .bind(phone)
            .bind(&now)
            .execute(db.pool())
            .await
            .unwrap();
        }
        let template = create_template(db.pool(), "o", "t", "{{name}} in {{city}}")
            .await
            .unwrap();

        let req = CreateCampaign {
            name: "from import".to_string(),
            message_content: None,
            template_id: Some(template.id),
            recipients: Recipients::Import {
                import_id: "imp_1".to_string(),
            },
            scheduled_start_at: None,
            scheduled_end_at: None,
        };
        let campaign = create_campaign(db.pool(), &bus, "o", req.clone()).await.unwrap();
        assert_eq!(campaign.total_messages, 3);

        let messages = messages_of(db.pool(), &campaign.id).await;
        assert!(messages.iter().all(|m| m.import_id.as_deref() == Some("imp_1")));
        let vars = messages[2].variables.as_ref().unwrap();
        assert_eq!(vars.get("city").map(String::as_str), Some("Lima"));
        assert_eq!(vars.get("name").map(String::as_str), Some("Ana"));

        assert!(matches!(
            create_campaign(db.pool(), &bus, "intruder", req).await,
            Err(Error::NotFound { .. })
        ));
    }
}
