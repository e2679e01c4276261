//! The dispatch queue.
//!
//! The queue is the `messages` table itself: rows in `queued` or `scheduled`
//! whose send time has passed, whose retry delay has elapsed and whose
//! campaign (if any) is active. [`DispatchQueue::claim_batch`] hands each such
//! row to exactly one caller. SQLite has no `SKIP LOCKED`; instead the whole
//! select-and-mark is one `UPDATE ... RETURNING` statement, which runs under
//! the database write lock, and every claimed row is stamped with a fresh
//! claim token that later outcome updates must present.

pub mod dispatcher;

use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::db::{self, to_db};
use crate::error::Result;
use crate::events::{EventBus, StatusEvent};
use crate::model::Message;

pub use dispatcher::{BatchReport, Dispatcher};

#[derive(Clone)]
pub struct DispatchQueue {
    pool: SqlitePool,
    bus: EventBus,
}

impl DispatchQueue {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Atomically claim up to `limit` eligible messages for `worker_id`.
    ///
    /// Concurrent callers receive disjoint sets. Each claimed message gets a
    /// `message:claimed` event in the same transaction.
    pub async fn claim_batch(&self, worker_id: &str, limit: u32) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = db::now();
        let now_text = to_db(now);
        let token = Uuid::new_v4().simple().to_string();

        let mut tx = self.pool.begin().await?;
        let mut claimed: Vec<Message> = sqlx::query_as(
            "UPDATE messages \
             SET previous_status = status, status = 'claimed', claim_token = ?1, \
                 claimed_by = ?2, claimed_at = ?3, updated_at = ?3 \
             WHERE id IN ( \
                 SELECT m.id FROM messages m \
                 WHERE m.status IN ('queued', 'scheduled') \
                   AND m.content IS NOT NULL \
                   AND (m.scheduled_at IS NULL OR m.scheduled_at <= ?3) \
                   AND (m.next_attempt_at IS NULL OR m.next_attempt_at <= ?3) \
                   AND (m.campaign_id IS NULL OR EXISTS ( \
                       SELECT 1 FROM campaigns c \
                       WHERE c.id = m.campaign_id AND c.status = 'active' \
                         AND (c.scheduled_end_at IS NULL OR c.scheduled_end_at > ?3))) \
                 ORDER BY m.created_at, m.id \
                 LIMIT ?4) \
             RETURNING *",
        )
        .bind(&token)
        .bind(worker_id)
        .bind(&now_text)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        for message in &claimed {
            let event = StatusEvent::for_message(message, message.previous_status, now);
            self.bus.record(&mut tx, &event, None).await?;
        }
        tx.commit().await?;

        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        if !claimed.is_empty() {
            debug!(worker_id = %worker_id, claimed = claimed.len(), "dispatch_batch_claimed");
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::db::open_temp;
    use crate::status::MessageStatus;
    use crate::testutil::insert_message;

    #[tokio::test]
    async fn test_claim_marks_rows_and_records_events() {
        let (_dir, db) = open_temp().await;
        let queue = DispatchQueue::new(db.pool().clone(), EventBus::default());
        for _ in 0..3 {
            insert_message(&db, "o", MessageStatus::Queued).await;
        }

        let batch = queue.claim_batch("w1", 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        for m in &batch {
            assert_eq!(m.status, MessageStatus::Claimed);
            assert_eq!(m.previous_status, Some(MessageStatus::Queued));
            assert_eq!(m.claimed_by.as_deref(), Some("w1"));
            assert!(m.claim_token.is_some());
        }

        let (events,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM message_events WHERE event_type = 'message:claimed'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(events, 2);

        assert_eq!(queue.claim_batch("w2", 10).await.unwrap().len(), 1);
        assert!(queue.claim_batch("w3", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ineligible_rows_are_skipped() {
        let (_dir, db) = open_temp().await;
        let queue = DispatchQueue::new(db.pool().clone(), EventBus::default());
        let future = insert_message(&db, "o", MessageStatus::Scheduled).await;
        let backing_off = insert_message(&db, "o", MessageStatus::Queued).await;
        let no_content = insert_message(&db, "o", MessageStatus::Queued).await;
        insert_message(&db, "o", MessageStatus::Failed).await;

        let later = to_db(db::now() + chrono::Duration::hours(1));
        sqlx::query("UPDATE messages SET scheduled_at = ? WHERE id = ?")
            .bind(&later)
            .bind(&future)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE messages SET next_attempt_at = ? WHERE id = ?")
            .bind(&later)
            .bind(&backing_off)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE messages SET content = NULL WHERE id = ?")
            .bind(&no_content)
            .execute(db.pool())
            .await
            .unwrap();

        assert!(queue.claim_batch("w", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_disjoint() {
        let (_dir, db) = open_temp().await;
        let queue = DispatchQueue::new(db.pool().clone(), EventBus::default());
        let mut expected = HashSet::new();
        for _ in 0..60 {
            expected.insert(insert_message(&db, "o", MessageStatus::Queued).await);
        }

        let queue = Arc::new(queue);
        let mut handles = Vec::new();
        for w in 0..6 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = queue.claim_batch(&format!("w{w}"), 7).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|m| m.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "message claimed twice");
            }
        }
        assert_eq!(seen, expected);
    }
}
