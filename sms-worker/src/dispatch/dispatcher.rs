//! Claim -> send -> transition worker loops.
//!
//! Each worker loop claims a batch and fans the messages out as tasks. Every
//! task takes a permit from the process-wide gateway limiter before calling
//! the gateway, so batch size and send concurrency are independent. A loop
//! only claims again once every task of the previous batch has finished;
//! shutdown is observed between batches, never in the middle of a send.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::DispatchQueue;
use crate::campaign::refresh_completion;
use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::gateway::{Gateway, Outcome, SendRequest};
use crate::model::Message;
use crate::status::{MessageStatus, StatusMachine, TransitionContext};
use crate::util::backoff::backoff_delay;

/// What happened to one claimed batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Outcomes that could not be recorded (claim lost, storage error).
    pub errors: usize,
}

pub struct Dispatcher {
    config: Arc<Config>,
    queue: DispatchQueue,
    machine: StatusMachine,
    gateway: Arc<dyn Gateway>,
    limiter: Arc<Semaphore>,
}

impl Dispatcher {
    /// `limiter` is shared by every worker loop in the process.
    pub fn new(
        config: Arc<Config>,
        queue: DispatchQueue,
        machine: StatusMachine,
        gateway: Arc<dyn Gateway>,
        limiter: Arc<Semaphore>,
    ) -> Self {
        Self {
            config,
            queue,
            machine,
            gateway,
            limiter,
        }
    }

    /// Run one worker loop until `shutdown` fires.
    pub async fn run_worker(self: Arc<Self>, worker_id: String, shutdown: CancellationToken) {
        info!(worker_id = %worker_id, "dispatch_worker_started");
        let idle = self.config.dispatch_poll_interval();

        while !shutdown.is_cancelled() {
            let batch = match self
                .queue
                .claim_batch(&worker_id, self.config.dispatch_batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, kind = ?e.kind(), "dispatch_claim_failed");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle) => continue,
                }
            }

            let report = self.process_batch(batch).await;
            info!(
                worker_id = %worker_id,
                processed = report.processed,
                requeued = report.requeued,
                failed = report.failed,
                errors = report.errors,
                "dispatch_batch_complete"
            );
        }

        info!(worker_id = %worker_id, "dispatch_worker_stopped");
    }

    /// Send every message of a claimed batch and record the outcomes.
    pub async fn process_batch(self: &Arc<Self>, batch: Vec<Message>) -> BatchReport {
        let campaigns: BTreeSet<String> =
            batch.iter().filter_map(|m| m.campaign_id.clone()).collect();

        let mut tasks = JoinSet::new();
        for message in batch {
            let this = Arc::clone(self);
            tasks.spawn(async move { this.dispatch_one(message).await });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(MessageStatus::Processed)) => report.processed += 1,
                Ok(Ok(MessageStatus::Queued)) => report.requeued += 1,
                Ok(Ok(_)) => report.failed += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "dispatch_outcome_not_recorded");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "dispatch_task_panicked");
                    report.errors += 1;
                }
            }
        }

        if let Err(e) = refresh_completion(self.machine.pool(), &campaigns).await {
            warn!(error = %e, "campaign_completion_refresh_failed");
        }
        report
    }

    async fn dispatch_one(&self, message: Message) -> Result<MessageStatus> {
        let outcome = match SendRequest::from_message(&message) {
            Some(request) => {
                // The semaphore is never closed.
                let _permit = self.limiter.acquire().await.ok();
                self.gateway.send(&request).await
            }
            None => Outcome::PermanentFailure("message has no content".to_string()),
        };

        let (to, ctx) = self.plan(&message, &outcome);
        info!(
            message_id = %message.id,
            outcome = outcome.label(),
            attempt = message.attempts + 1,
            next_status = %to,
            "dispatch_outcome"
        );
        let updated = self.machine.transition(&message.id, to, ctx).await?;
        Ok(updated.status)
    }

    /// Decide the transition for a gateway outcome.
    fn plan(&self, message: &Message, outcome: &Outcome) -> (MessageStatus, TransitionContext) {
        let mut ctx = TransitionContext {
            increment_attempts: true,
            claim_token: message.claim_token.clone(),
            ..Default::default()
        };
        let attempt = u32::try_from(message.attempts + 1).unwrap_or(u32::MAX);

        let to = match outcome {
            Outcome::Accepted(gateway_id) => {
                ctx.gateway_id = Some(gateway_id.clone());
                MessageStatus::Processed
            }
            Outcome::TransientFailure(reason) if attempt < self.config.send_max_attempts => {
                let delay = backoff_delay(attempt, self.config.send_backoff_ms);
                let delay = ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                ctx.next_attempt_at = Some(db::now() + delay);
                ctx.reason = Some(format!("transient: {reason}"));
                MessageStatus::Queued
            }
            Outcome::TransientFailure(reason) => {
                ctx.reason = Some(format!("retry budget exhausted after {attempt} attempts: {reason}"));
                MessageStatus::Failed
            }
            Outcome::PermanentFailure(reason) => {
                ctx.reason = Some(reason.clone());
                MessageStatus::Failed
            }
        };
        (to, ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::db::open_temp;
    use crate::events::EventBus;
    use crate::messages::find_message;
    use crate::testutil::insert_message;

    /// Answers from a per-message script and tracks peak concurrency.
    struct ScriptedGateway {
        script: Mutex<HashMap<String, Outcome>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedGateway {
        fn new(script: Vec<(String, Outcome)>, delay: Duration) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Gateway for ScriptedGateway {
        async fn send(&self, request: &SendRequest) -> Outcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .remove(&request.correlation_id)
                .unwrap_or_else(|| Outcome::Accepted(format!("gw-{}", request.correlation_id)))
        }
    }

    fn dispatcher(
        pool: &sqlx::SqlitePool,
        config: Config,
        gateway: Arc<dyn Gateway>,
    ) -> Arc<Dispatcher> {
        let bus = EventBus::default();
        let limiter = Arc::new(Semaphore::new(config.gateway_concurrency));
        Arc::new(Dispatcher::new(
            Arc::new(config),
            DispatchQueue::new(pool.clone(), bus.clone()),
            StatusMachine::new(pool.clone(), bus),
            gateway,
            limiter,
        ))
    }

    #[tokio::test]
    async fn test_outcomes_drive_transitions() {
        let (_dir, db) = open_temp().await;
        let ok = insert_message(&db, "o", MessageStatus::Queued).await;
        let flaky = insert_message(&db, "o", MessageStatus::Queued).await;
        let bad = insert_message(&db, "o", MessageStatus::Queued).await;

        let gateway = Arc::new(ScriptedGateway::new(
            vec![
                (ok.clone(), Outcome::Accepted("gw-ok".to_string())),
                (flaky.clone(), Outcome::TransientFailure("503".to_string())),
                (bad.clone(), Outcome::PermanentFailure("invalid destination".to_string())),
            ],
            Duration::ZERO,
        ));
        let d = dispatcher(db.pool(), Config::default(), gateway);

        let batch = d.queue.claim_batch("w", 10).await.unwrap();
        assert_eq!(batch.len(), 3);
        let report = d.process_batch(batch).await;
        assert_eq!(
            report,
            BatchReport {
                processed: 1,
                requeued: 1,
                failed: 1,
                errors: 0
            }
        );

        let ok = find_message(db.pool(), &ok).await.unwrap().unwrap();
        assert_eq!(ok.gateway_message_id.as_deref(), Some("gw-ok"));
        assert_eq!(ok.attempts, 1);

        let flaky = find_message(db.pool(), &flaky).await.unwrap().unwrap();
        assert_eq!(flaky.attempts, 1);
        assert!(flaky.next_attempt_at.unwrap() > db::now());
        assert!(flaky.claim_token.is_none());

        let bad = find_message(db.pool(), &bad).await.unwrap().unwrap();
        assert_eq!(bad.reason.as_deref(), Some("invalid destination"));
    }

    #[tokio::test]
    async fn test_transient_failure_exhausts_budget() {
        let (_dir, db) = open_temp().await;
        let id = insert_message(&db, "o", MessageStatus::Queued).await;
        sqlx::query("UPDATE messages SET attempts = 2 WHERE id = ?")
            .bind(&id)
            .execute(db.pool())
            .await
            .unwrap();

        let gateway = Arc::new(ScriptedGateway::new(
            vec![(id.clone(), Outcome::TransientFailure("timeout".to_string()))],
            Duration::ZERO,
        ));
        let d = dispatcher(db.pool(), Config::default(), gateway);
        let batch = d.queue.claim_batch("w", 1).await.unwrap();
        let report = d.process_batch(batch).await;
        assert_eq!(report.failed, 1);

        let msg = find_message(db.pool(), &id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.attempts, 3);
        assert!(msg.reason.unwrap().contains("retry budget exhausted"));
    }

    #[tokio::test]
    async fn test_limiter_bounds_in_flight_sends() {
        let (_dir, db) = open_temp().await;
        for _ in 0..12 {
            insert_message(&db, "o", MessageStatus::Queued).await;
        }
        let gateway = Arc::new(ScriptedGateway::new(Vec::new(), Duration::from_millis(20)));
        let config = Config {
            gateway_concurrency: 3,
            ..Config::default()
        };
        let d = dispatcher(db.pool(), config, gateway.clone());

        let batch = d.queue.claim_batch("w", 12).await.unwrap();
        let report = d.process_batch(batch).await;
        assert_eq!(report.processed, 12);
        assert!(gateway.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown_after_finishing_batch() {
        let (_dir, db) = open_temp().await;
        for _ in 0..4 {
            insert_message(&db, "o", MessageStatus::Queued).await;
        }
        let gateway = Arc::new(ScriptedGateway::new(Vec::new(), Duration::from_millis(50)));
        let config = Config {
            dispatch_poll_interval_ms: 10,
            ..Config::default()
        };
        let d = dispatcher(db.pool(), config, gateway);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&d).run_worker("w".to_string(), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let (claimed,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE status = 'claimed'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(claimed, 0);
    }
}
