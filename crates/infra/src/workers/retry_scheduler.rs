//! Retry scheduler: redelivers queued webhook failures.
//!
//! Each tick recovers stalled claims, claims a batch of due records, and
//! redelivers them through the same handler registry the HTTP boundary
//! uses. Attempts run concurrently up to a semaphore bound; resolution is
//! written back per record so one slow handler cannot hold up the batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use inflow_core::PipelineError;
use inflow_webhooks::failure::{AttemptOutcome, FailureStatus, WebhookFailureRecord};
use inflow_webhooks::handler::HandlerRegistry;
use inflow_webhooks::retry::RetryPolicy;
use inflow_webhooks::store::FailureQueueStore;

use super::WorkerHandle;

#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    pub poll_interval: Duration,
    /// Records claimed per tick.
    pub batch_size: usize,
    /// Concurrent redelivery attempts within a tick.
    pub max_concurrent: usize,
    /// A `processing` record older than this is presumed orphaned by a
    /// crashed scheduler and returned to `pending`.
    pub stall_threshold: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 32,
            max_concurrent: 8,
            stall_threshold: Duration::from_secs(600),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// What one tick did, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub recovered_stalled: u64,
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

pub struct RetryScheduler {
    store: Arc<dyn FailureQueueStore>,
    registry: Arc<HandlerRegistry>,
    config: RetrySchedulerConfig,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn FailureQueueStore>,
        registry: Arc<HandlerRegistry>,
        config: RetrySchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// One scheduler pass. Store errors abort the tick; claimed records left
    /// in `processing` are picked up by stall recovery on a later tick.
    pub async fn tick(&self) -> Result<TickSummary, PipelineError> {
        let now = Utc::now();
        let mut summary = TickSummary::default();

        summary.recovered_stalled = self
            .store
            .recover_stalled(now, self.config.stall_threshold)
            .await
            .map_err(|e| PipelineError::transient(e.to_string()))?;
        if summary.recovered_stalled > 0 {
            warn!(
                count = summary.recovered_stalled,
                "recovered stalled failure records"
            );
        }

        let claimed = self
            .store
            .claim_due(now, self.config.batch_size)
            .await
            .map_err(|e| PipelineError::transient(e.to_string()))?;
        summary.claimed = claimed.len();
        if claimed.is_empty() {
            return Ok(summary);
        }
        debug!(count = claimed.len(), "claimed due failure records");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut attempts = JoinSet::new();
        for record in claimed {
            let store = self.store.clone();
            let registry = self.registry.clone();
            let policy = self.config.retry_policy.clone();
            let semaphore = Arc::clone(&semaphore);
            attempts.spawn(async move {
                // Semaphore is never closed while attempts run.
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                attempt(store, registry, policy, record).await
            });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Some(status)) => match status {
                    FailureStatus::Succeeded => summary.succeeded += 1,
                    FailureStatus::Pending => summary.rescheduled += 1,
                    FailureStatus::DeadLetter => summary.dead_lettered += 1,
                    FailureStatus::Processing => {}
                },
                Ok(None) => {}
                Err(e) => error!(error = %e, "redelivery task panicked"),
            }
        }

        info!(
            claimed = summary.claimed,
            succeeded = summary.succeeded,
            rescheduled = summary.rescheduled,
            dead_lettered = summary.dead_lettered,
            "retry tick complete"
        );
        Ok(summary)
    }

    /// Run the scheduler loop until shutdown.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let poll_interval = self.config.poll_interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = poll_interval.as_secs(), "retry scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(error = %e, "retry tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("retry scheduler stopping");
                        break;
                    }
                }
            }
        });

        WorkerHandle::new("retry-scheduler", shutdown_tx, join)
    }
}

/// Redeliver one claimed record and persist the resolution. Returns the
/// record's final status, or `None` when the write-back itself failed
/// (the record stays `processing` until stall recovery).
async fn attempt(
    store: Arc<dyn FailureQueueStore>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    mut record: WebhookFailureRecord,
) -> Option<FailureStatus> {
    let event = record.event();
    let outcome = match registry.get(record.source) {
        // No handler is a deployment error, not an infrastructure one.
        None => AttemptOutcome::Permanent(format!(
            "no handler registered for source {}",
            record.source.as_str()
        )),
        Some(handler) => match handler.handle(&event).await {
            Ok(()) => AttemptOutcome::Success,
            Err(e) if e.is_transient() => AttemptOutcome::Transient(e.to_string()),
            Err(e) => AttemptOutcome::Permanent(e.to_string()),
        },
    };

    let now = Utc::now();
    record.resolve(outcome, &policy, now);

    match record.status {
        FailureStatus::DeadLetter => warn!(
            failure_id = %record.id,
            source = record.source.as_str(),
            event_name = %record.event_name,
            attempts = record.attempt_count,
            error = record.last_error.as_deref().unwrap_or(""),
            "failure record moved to dead letter"
        ),
        FailureStatus::Pending => debug!(
            failure_id = %record.id,
            attempts = record.attempt_count,
            next_retry_at = ?record.next_retry_at,
            "redelivery failed transiently, rescheduled"
        ),
        _ => {}
    }

    if let Err(e) = store.update(&record).await {
        error!(failure_id = %record.id, error = %e, "failed to persist attempt resolution");
        return None;
    }
    Some(record.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    use inflow_core::PipelineResult;
    use inflow_webhooks::event::{WebhookEvent, WebhookSource};
    use inflow_webhooks::handler::WebhookHandler;

    use crate::failure_store::InMemoryFailureQueue;

    struct FailNTimes {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl WebhookHandler for FailNTimes {
        async fn handle(&self, _event: &WebhookEvent) -> PipelineResult<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(PipelineError::transient("downstream timeout"));
            }
            Ok(())
        }
    }

    fn scheduler(
        store: Arc<InMemoryFailureQueue>,
        handler: Arc<dyn WebhookHandler>,
    ) -> Arc<RetryScheduler> {
        let mut registry = HandlerRegistry::new();
        registry.register(WebhookSource::Payments, handler);
        Arc::new(RetryScheduler::new(
            store,
            Arc::new(registry),
            RetrySchedulerConfig {
                retry_policy: RetryPolicy::without_jitter(
                    Duration::from_millis(0),
                    Duration::from_millis(0),
                ),
                ..Default::default()
            },
        ))
    }

    fn pending_record() -> WebhookFailureRecord {
        WebhookFailureRecord::new(
            WebhookSource::Payments,
            "checkout.completed",
            json!({"session_id": "cs_1"}),
            vec![],
            None,
        )
    }

    #[tokio::test]
    async fn eventual_success_marks_record_succeeded() {
        let store = Arc::new(InMemoryFailureQueue::new());
        let scheduler = scheduler(
            store.clone(),
            Arc::new(FailNTimes {
                failures_left: AtomicU32::new(2),
            }),
        );

        let id = store.enqueue(pending_record()).await.unwrap();

        // Two transient failures, then success on the third tick.
        for _ in 0..3 {
            scheduler.tick().await.unwrap();
        }

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, FailureStatus::Succeeded);
        assert_eq!(record.attempt_count, 2);
        assert!(record.processed_at.is_some());
    }

    #[tokio::test]
    async fn budget_exhaustion_dead_letters() {
        let store = Arc::new(InMemoryFailureQueue::new());
        let scheduler = scheduler(
            store.clone(),
            Arc::new(FailNTimes {
                failures_left: AtomicU32::new(u32::MAX),
            }),
        );

        let id = store
            .enqueue(pending_record().with_max_attempts(3))
            .await
            .unwrap();

        for _ in 0..5 {
            scheduler.tick().await.unwrap();
        }

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, FailureStatus::DeadLetter);
        assert_eq!(record.attempt_count, 3);
        assert!(record.moved_to_dead_letter_at.is_some());
    }

    #[tokio::test]
    async fn missing_handler_is_a_permanent_failure() {
        let store = Arc::new(InMemoryFailureQueue::new());
        // Registry covers payments only; enqueue an email failure.
        let scheduler = scheduler(
            store.clone(),
            Arc::new(FailNTimes {
                failures_left: AtomicU32::new(0),
            }),
        );

        let orphan = WebhookFailureRecord::new(
            WebhookSource::Email,
            "message.bounced",
            json!({}),
            vec![],
            None,
        );
        let id = store.enqueue(orphan).await.unwrap();

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.dead_lettered, 1);

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, FailureStatus::DeadLetter);
    }
}
