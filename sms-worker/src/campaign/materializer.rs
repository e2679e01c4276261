//! Expansion of a campaign into per-recipient message rows.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::db::{self, to_db};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::messages::{insert_message, validate_content, NewMessage};
use crate::model::{Campaign, Contact, Message, MessageTemplate, Variables};
use crate::status::{MessageStatus, StatusMachine, TransitionContext};
use crate::template::render;

/// Contacts read per page while materializing from an import.
pub(crate) const PAGE_SIZE: i64 = 1000;

/// A validated recipient ready to become a message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Target {
    pub phone: String,
    pub name: Option<String>,
    pub variables: Variables,
}

impl Target {
    fn from_contact(contact: Contact) -> Self {
        Target {
            phone: contact.phone,
            name: contact.name,
            variables: contact.variables,
        }
    }
}

pub(crate) enum Source<'a> {
    Inline(&'a [Target]),
    Import(&'a str),
}

fn new_message(campaign: &Campaign, target: Target) -> NewMessage {
    // Template messages carry what rendering needs; literal ones carry nothing.
    let variables = campaign.template_id.as_ref().map(|_| {
        let mut vars = target.variables;
        if let Some(name) = target.name {
            vars.entry("name".to_string()).or_insert(name);
        }
        vars.entry("phone".to_string())
            .or_insert_with(|| target.phone.clone());
        vars
    });

    NewMessage {
        owner_id: campaign.owner_id.clone(),
        campaign_id: Some(campaign.id.clone()),
        batch_id: Some(campaign.batch_id.clone()),
        import_id: campaign.import_id.clone(),
        template_id: campaign.template_id.clone(),
        variables,
        phone_number: target.phone,
        content: campaign.message_content.clone(),
        custom_id: None,
        scheduled_at: campaign.scheduled_start_at,
    }
}

/// Create one message per recipient on `conn`. Returns how many were created.
///
/// Runs inside the transaction that created the campaign row, so either every
/// message of the batch is visible or none is.
pub(crate) async fn materialize(
    conn: &mut SqliteConnection,
    bus: &EventBus,
    campaign: &Campaign,
    source: Source<'_>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let mut created = 0i64;
    match source {
        Source::Inline(targets) => {
            for target in targets {
                insert_message(conn, bus, &new_message(campaign, target.clone()), now).await?;
                created += 1;
            }
        }
        Source::Import(import_id) => {
            let mut after = -1i64;
            loop {
                let page: Vec<Contact> = sqlx::query_as(
                    "SELECT * FROM contacts WHERE import_id = ?1 AND row_index > ?2 \
                     ORDER BY row_index LIMIT ?3",
                )
                .bind(import_id)
                .bind(after)
                .bind(PAGE_SIZE)
                .fetch_all(&mut *conn)
                .await?;

                let Some(last) = page.last() else { break };
                after = last.row_index;
                let full = page.len() as i64 == PAGE_SIZE;

                for contact in page {
                    let new = new_message(campaign, Target::from_contact(contact));
                    insert_message(conn, bus, &new, now).await?;
                    created += 1;
                }
                debug!(campaign_id = %campaign.id, created = created, "campaign_page_materialized");
                if !full {
                    break;
                }
            }
        }
    }

    sqlx::query("UPDATE campaigns SET total_messages = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(created)
        .bind(to_db(now))
        .bind(&campaign.id)
        .execute(&mut *conn)
        .await?;

    info!(
        campaign_id = %campaign.id,
        batch_id = %campaign.batch_id,
        messages = created,
        "campaign_materialized"
    );
    Ok(created)
}

/// What rendering a campaign's pending messages did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RenderReport {
    pub rendered: u64,
    pub failed: u64,
}

/// Render every not-yet-rendered message of `campaign_id` from its own
/// variables. Messages with missing variables, or whose rendered content is
/// not a valid body, fail with the problem as reason.
///
/// Unrendered messages have no content and are never claimed, so pages can
/// be committed independently.
pub(crate) async fn render_pending(
    machine: &StatusMachine,
    campaign_id: &str,
    template: &MessageTemplate,
) -> Result<RenderReport> {
    let pool: &SqlitePool = machine.pool();
    let mut report = RenderReport::default();

    loop {
        let page: Vec<Message> = sqlx::query_as(
            "SELECT * FROM messages \
             WHERE campaign_id = ?1 AND content IS NULL AND status IN ('queued', 'scheduled') \
             ORDER BY created_at, id LIMIT ?2",
        )
        .bind(campaign_id)
        .bind(PAGE_SIZE)
        .fetch_all(pool)
        .await?;
        if page.is_empty() {
            break;
        }

        let before = report;
        let now = to_db(db::now());
        let mut tx = pool.begin().await?;

        for message in &page {
            let empty = Variables::new();
            let rendered = render(&template.content, message.variables.as_ref().unwrap_or(&empty));
            let problem = if rendered.is_complete() {
                validate_content(&rendered.content).err().map(|e| match e {
                    Error::Validation(msg) => msg,
                    other => other.to_string(),
                })
            } else {
                Some(format!(
                    "missing template variables: {}",
                    rendered.missing.join(", ")
                ))
            };

            match problem {
                None => {
                    let updated = sqlx::query(
                        "UPDATE messages SET content = ?1, updated_at = ?2 \
                         WHERE id = ?3 AND content IS NULL",
                    )
                    .bind(&rendered.content)
                    .bind(&now)
                    .bind(&message.id)
                    .execute(&mut *tx)
                    .await?;
                    report.rendered += updated.rows_affected();
                }
                Some(reason) => {
                    let ctx = TransitionContext::reason(reason);
                    if machine
                        .apply(&mut tx, message, MessageStatus::Failed, &ctx)
                        .await?
                        .is_some()
                    {
                        report.failed += 1;
                    }
                }
            }
        }
        tx.commit().await?;

        if report == before {
            // Nothing on this page could be changed; stop rather than spin.
            break;
        }
    }

    info!(
        campaign_id = %campaign_id,
        rendered = report.rendered,
        failed = report.failed,
        "campaign_content_rendered"
    );
    Ok(report)
}

/// Fail every message of `campaign_id` that has not been claimed yet.
pub(crate) async fn fail_unsent(
    machine: &StatusMachine,
    campaign_id: &str,
    reason: &str,
) -> Result<u64> {
    let pool = machine.pool();
    let ctx = TransitionContext::reason(reason);
    let mut failed = 0u64;

    loop {
        let page: Vec<Message> = sqlx::query_as(
            "SELECT * FROM messages WHERE campaign_id = ?1 AND status IN ('queued', 'scheduled') \
             ORDER BY created_at, id LIMIT ?2",
        )
        .bind(campaign_id)
        .bind(PAGE_SIZE)
        .fetch_all(pool)
        .await?;
        if page.is_empty() {
            break;
        }

        let mut changed = 0u64;
        let mut tx = pool.begin().await?;
        for message in &page {
            if machine
                .apply(&mut tx, message, MessageStatus::Failed, &ctx)
                .await?
                .is_some()
            {
                changed += 1;
            }
        }
        tx.commit().await?;

        if changed == 0 {
            break;
        }
        failed += changed;
    }
    Ok(failed)
}

/// Mark active campaigns whose messages have all left the queue as completed.
pub async fn refresh_completion(pool: &SqlitePool, campaign_ids: &BTreeSet<String>) -> Result<()> {
    for id in campaign_ids {
        let now = to_db(db::now());
        let done = sqlx::query(
            "UPDATE campaigns SET status = 'completed', completed_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND status = 'active' AND NOT EXISTS ( \
                 SELECT 1 FROM messages WHERE campaign_id = ?2 \
                   AND status IN ('queued', 'scheduled', 'claimed'))",
        )
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await?;

        if done.rows_affected() > 0 {
            info!(campaign_id = %id, "campaign_completed");
        }
    }
    Ok(())
}
