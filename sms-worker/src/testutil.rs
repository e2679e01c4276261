//! Fixtures shared by unit tests.

use crate::db::{self, new_id, to_db, Database};
use crate::status::MessageStatus;

/// Insert a standalone message with literal content in `status`.
pub async fn insert_message(db: &Database, owner: &str, status: MessageStatus) -> String {
    let id = new_id("msg");
    let now = to_db(db::now());
    sqlx::query(
        "INSERT INTO messages (id, owner_id, phone_number, content, status, \
         queued_at, created_at, updated_at) VALUES (?1, ?2, '+15550000001', 'hello', ?3, ?4, ?4, ?4)",
    )
    .bind(&id)
    .bind(owner)
    .bind(status.as_str())
    .bind(&now)
    .execute(db.pool())
    .await
    .unwrap();
    id
}

pub async fn insert_webhook(db: &Database, owner: &str, events: &[&str], active: bool) -> String {
    let id = new_id("whk");
    sqlx::query(
        "INSERT INTO webhooks (id, owner_id, url, event_types, is_active, created_at) \
         VALUES (?1, ?2, 'http://127.0.0.1:9/hook', ?3, ?4, ?5)",
    )
    .bind(&id)
    .bind(owner)
    .bind(serde_json::to_string(events).unwrap())
    .bind(active)
    .bind(to_db(db::now()))
    .execute(db.pool())
    .await
    .unwrap();
    id
}
