//! End-to-end pipeline tests over the in-memory stores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use inflow_core::{PipelineError, PipelineResult};
use inflow_sync::canonical::CrmJob;
use inflow_sync::crm::{CrmClient, CrmPage, CrmRecord};
use inflow_sync::merge::{CrmJobMerger, MergeError, MergeProcessor, RecordMerger};
use inflow_sync::runner::{SyncConfig, SyncOutcome, SyncRunner};
use inflow_sync::staging::StagingRecord;
use inflow_sync::store::{CanonicalStore, WatermarkStore};
use inflow_sync::watermark::SyncType;
use inflow_webhooks::event::{WebhookEvent, WebhookSource};
use inflow_webhooks::failure::{FailureStatus, WebhookFailureRecord};
use inflow_webhooks::handler::{HandlerRegistry, WebhookHandler};
use inflow_webhooks::retry::RetryPolicy;
use inflow_webhooks::store::FailureQueueStore;

use crate::failure_store::InMemoryFailureQueue;
use crate::sync_store::{InMemoryCanonicalStore, InMemoryStagingStore, InMemoryWatermarkStore};
use crate::workers::{RetryScheduler, RetrySchedulerConfig};

struct AlwaysTimesOut;

#[async_trait]
impl WebhookHandler for AlwaysTimesOut {
    async fn handle(&self, _event: &WebhookEvent) -> PipelineResult<()> {
        Err(PipelineError::transient("email provider timeout"))
    }
}

fn zero_delay_scheduler(store: Arc<InMemoryFailureQueue>) -> Arc<RetryScheduler> {
    let mut registry = HandlerRegistry::new();
    registry.register(WebhookSource::Payments, Arc::new(AlwaysTimesOut));
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

#[tokio::test]
async fn persistent_downstream_failure_dead_letters_and_stays_there() {
    let store = Arc::new(InMemoryFailureQueue::new());
    let scheduler = zero_delay_scheduler(store.clone());

    let record = WebhookFailureRecord::new(
        WebhookSource::Payments,
        "checkout.completed",
        json!({"session_id": "cs_9", "customer_email": "lee@example.com"}),
        vec![("x-webhook-timestamp".into(), "1756400000".into())],
        Some("sha256=aa".into()),
    );
    let id = store.enqueue(record).await.unwrap();

    // Five retry budget attempts, all timing out, then several idle ticks.
    for _ in 0..8 {
        scheduler.tick().await.unwrap();
    }

    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, FailureStatus::DeadLetter);
    assert_eq!(record.attempt_count, 5);
    assert!(record.next_retry_at.is_none());

    // Dead letters are never auto-claimed again.
    let summary = scheduler.tick().await.unwrap();
    assert_eq!(summary.claimed, 0);

    // The original payload survives intact for operator replay.
    assert_eq!(record.raw_payload["session_id"], "cs_9");
    assert_eq!(record.signature.as_deref(), Some("sha256=aa"));
}

#[tokio::test]
async fn manual_retry_grants_a_fresh_budget() {
    let store = Arc::new(InMemoryFailureQueue::new());
    let scheduler = zero_delay_scheduler(store.clone());

    let id = store
        .enqueue(
            WebhookFailureRecord::new(
                WebhookSource::Payments,
                "checkout.completed",
                json!({}),
                vec![],
                None,
            )
            .with_max_attempts(2),
        )
        .await
        .unwrap();

    for _ in 0..3 {
        scheduler.tick().await.unwrap();
    }
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        FailureStatus::DeadLetter
    );

    let reset = store.retry_dead_letter(id).await.unwrap();
    assert_eq!(reset.status, FailureStatus::Pending);
    assert_eq!(reset.attempt_count, 0);

    // The fresh budget burns down again from zero.
    for _ in 0..3 {
        scheduler.tick().await.unwrap();
    }
    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, FailureStatus::DeadLetter);
    assert_eq!(record.attempt_count, 2);
}

/// Serves a fixed change stream in pages, honoring the `since` cursor
/// inclusively the way the real endpoint does.
struct FixtureCrm {
    records: Vec<CrmRecord>,
}

impl FixtureCrm {
    fn job(n: u32, modified_on: DateTime<Utc>, parseable: bool) -> CrmRecord {
        let external_id = format!("J-{n}");
        let data = if parseable {
            json!({
                "id": external_id,
                "title": format!("Job {n}"),
                "status": "scheduled",
                "modified_on": modified_on.to_rfc3339(),
            })
        } else {
            // Missing required fields; parse fails permanently.
            json!({"id": external_id, "note": "manual entry"})
        };
        CrmRecord {
            external_id,
            modified_on,
            data,
        }
    }
}

#[async_trait]
impl CrmClient for FixtureCrm {
    async fn fetch_modified_since(
        &self,
        since: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> PipelineResult<CrmPage> {
        let matching: Vec<CrmRecord> = self
            .records
            .iter()
            .filter(|r| since.is_none_or(|s| r.modified_on >= s))
            .cloned()
            .collect();

        let start = (page as usize) * (page_size as usize);
        let end = (start + page_size as usize).min(matching.len());
        let records = if start < matching.len() {
            matching[start..end].to_vec()
        } else {
            Vec::new()
        };

        Ok(CrmPage {
            has_more: end < matching.len(),
            records,
        })
    }
}

fn runner(
    client: Arc<dyn CrmClient>,
    watermarks: Arc<InMemoryWatermarkStore>,
    staging: Arc<InMemoryStagingStore>,
    merger: Arc<dyn RecordMerger>,
) -> SyncRunner {
    let merge = MergeProcessor::new(staging.clone(), merger, 25);
    let mut config = SyncConfig::new(SyncType::from("crm_jobs"));
    config.page_size = 40;
    SyncRunner::new(client, watermarks, staging, merge, config)
}

#[tokio::test]
async fn bad_rows_are_isolated_and_the_watermark_still_advances() {
    let base = Utc.with_ymd_and_hms(2026, 8, 1, 8, 0, 0).unwrap();
    let records: Vec<CrmRecord> = (0..100)
        .map(|n| {
            // Rows 10, 40 and 70 carry payloads that never parse.
            let parseable = !matches!(n, 10 | 40 | 70);
            FixtureCrm::job(n, base + chrono::Duration::minutes(n as i64), parseable)
        })
        .collect();
    let newest = base + chrono::Duration::minutes(99);

    let watermarks = Arc::new(InMemoryWatermarkStore::new());
    let staging = Arc::new(InMemoryStagingStore::new());
    let canonical = Arc::new(InMemoryCanonicalStore::new());
    let runner = runner(
        Arc::new(FixtureCrm { records }),
        watermarks.clone(),
        staging.clone(),
        Arc::new(CrmJobMerger::new(canonical.clone())),
    );

    let outcome = runner.run().await.unwrap();
    let SyncOutcome::Completed(report) = outcome else {
        panic!("run should have completed");
    };

    assert_eq!(report.fetched, 100);
    assert_eq!(report.merge.processed, 97);
    assert_eq!(report.merge.failed, 3);
    assert_eq!(report.watermark_advanced_to, Some(newest));
    assert_eq!(canonical.count().await.unwrap(), 97);

    // The failed rows carry their terminal error on the staging side.
    let errored: Vec<StagingRecord> = staging
        .all()
        .await
        .into_iter()
        .filter(|r| r.processing_error.is_some())
        .collect();
    assert_eq!(errored.len(), 3);

    let wm = watermarks
        .get(&SyncType::from("crm_jobs"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wm.last_modified_on_fetched, Some(newest));
    assert!(!wm.running);
}

#[tokio::test]
async fn rerunning_over_the_same_window_is_idempotent() {
    let base = Utc.with_ymd_and_hms(2026, 8, 1, 8, 0, 0).unwrap();
    let records: Vec<CrmRecord> = (0..10)
        .map(|n| FixtureCrm::job(n, base + chrono::Duration::minutes(n as i64), true))
        .collect();

    let watermarks = Arc::new(InMemoryWatermarkStore::new());
    let staging = Arc::new(InMemoryStagingStore::new());
    let canonical = Arc::new(InMemoryCanonicalStore::new());
    let runner = runner(
        Arc::new(FixtureCrm { records }),
        watermarks.clone(),
        staging.clone(),
        Arc::new(CrmJobMerger::new(canonical.clone())),
    );

    runner.run().await.unwrap();
    assert_eq!(canonical.count().await.unwrap(), 10);

    // Second run re-fetches the record at the inclusive cursor boundary;
    // the upsert absorbs the duplicate.
    runner.run().await.unwrap();
    assert_eq!(canonical.count().await.unwrap(), 10);

    let job: CrmJob = canonical.get("J-9").await.unwrap().unwrap();
    assert_eq!(job.title, "Job 9");
}

/// Canonical store that fails every upsert until released.
struct FlakyMerger {
    inner: CrmJobMerger,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl RecordMerger for FlakyMerger {
    async fn merge(&self, record: &StagingRecord) -> Result<(), MergeError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(MergeError::Transient("canonical db unavailable".into()));
        }
        self.inner.merge(record).await
    }
}

#[tokio::test]
async fn unsettled_rows_hold_the_watermark_until_a_clean_run() {
    let base = Utc.with_ymd_and_hms(2026, 8, 1, 8, 0, 0).unwrap();
    let records: Vec<CrmRecord> = (0..5)
        .map(|n| FixtureCrm::job(n, base + chrono::Duration::minutes(n as i64), true))
        .collect();

    let watermarks = Arc::new(InMemoryWatermarkStore::new());
    let staging = Arc::new(InMemoryStagingStore::new());
    let canonical = Arc::new(InMemoryCanonicalStore::new());
    let broken = Arc::new(AtomicBool::new(true));
    let runner = runner(
        Arc::new(FixtureCrm { records }),
        watermarks.clone(),
        staging.clone(),
        Arc::new(FlakyMerger {
            inner: CrmJobMerger::new(canonical.clone()),
            broken: broken.clone(),
        }),
    );

    // First run: everything stages, nothing merges, cursor stays put.
    let err = runner.run().await.unwrap_err();
    assert!(err.is_transient());

    let wm = watermarks
        .get(&SyncType::from("crm_jobs"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(wm.last_modified_on_fetched, None);
    assert!(!wm.running, "failed run must release the lock");
    assert!(wm.last_error.is_some());

    // Second run with the store healthy: the leftover staged rows settle
    // and the cursor finally moves.
    broken.store(false, Ordering::SeqCst);
    runner.run().await.unwrap();

    assert_eq!(canonical.count().await.unwrap(), 5);
    let wm = watermarks
        .get(&SyncType::from("crm_jobs"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        wm.last_modified_on_fetched,
        Some(base + chrono::Duration::minutes(4))
    );
}
