//! Message template storage.

use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::db::{self, new_id, to_db};
use crate::error::{Error, Result};
use crate::messages::validate_content;
use crate::model::MessageTemplate;
use crate::template::extract_variables;

/// Store a new active template; its variable list is derived from `content`.
pub async fn create_template(
    pool: &SqlitePool,
    owner_id: &str,
    name: &str,
    content: &str,
) -> Result<MessageTemplate> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("template name is required"));
    }
    validate_content(content)?;

    let variables: Vec<String> = extract_variables(content).into_iter().collect();
    let template: MessageTemplate = sqlx::query_as(
        "INSERT INTO message_templates (id, owner_id, name, content, variables, is_active, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6) RETURNING *",
    )
    .bind(new_id("tpl"))
    .bind(owner_id)
    .bind(name)
    .bind(content)
    .bind(Json(&variables))
    .bind(to_db(db::now()))
    .fetch_one(pool)
    .await?;

    info!(
        template_id = %template.id,
        variables = template.variables.len(),
        "template_created"
    );
    Ok(template)
}

pub async fn get_template(pool: &SqlitePool, owner_id: &str, id: &str) -> Result<MessageTemplate> {
    sqlx::query_as("SELECT * FROM message_templates WHERE id = ?1 AND owner_id = ?2")
        .bind(id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found("template", id))
}

pub async fn deactivate_template(
    pool: &SqlitePool,
    owner_id: &str,
    id: &str,
) -> Result<MessageTemplate> {
    sqlx::query_as(
        "UPDATE message_templates SET is_active = 0 WHERE id = ?1 AND owner_id = ?2 RETURNING *",
    )
    .bind(id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::not_found("template", id))
}

/// Load a template the owner may send with: it must exist, be theirs and be
/// active.
pub async fn usable_template(
    conn: &mut SqliteConnection,
    owner_id: &str,
    id: &str,
) -> Result<MessageTemplate> {
    let template: Option<MessageTemplate> =
        sqlx::query_as("SELECT * FROM message_templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    let not_usable = |reason: &str| Error::TemplateNotUsable {
        template_id: id.to_string(),
        reason: reason.to_string(),
    };
    match template {
        None => Err(not_usable("template does not exist")),
        Some(t) if t.owner_id != owner_id => Err(not_usable("template belongs to another owner")),
        Some(t) if !t.is_active => Err(not_usable("template is inactive")),
        Some(t) => Ok(t),
    }
}
