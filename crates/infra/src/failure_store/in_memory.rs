//! In-memory failure queue for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use inflow_core::FailureId;
use inflow_webhooks::failure::{FailureStatus, WebhookFailureRecord};
use inflow_webhooks::store::{FailureQueueError, FailureQueueStore, QueueStats};

/// RwLock-backed queue. The claim is a compare-and-set under the write
/// lock, which gives the same exactly-one-winner guarantee the Postgres
/// implementation gets from a conditional UPDATE.
#[derive(Debug, Default)]
pub struct InMemoryFailureQueue {
    records: RwLock<HashMap<FailureId, WebhookFailureRecord>>,
}

impl InMemoryFailureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl FailureQueueStore for InMemoryFailureQueue {
    async fn enqueue(&self, record: WebhookFailureRecord) -> Result<FailureId, FailureQueueError> {
        let mut records = self.records.write().unwrap();
        let id = record.id;
        records.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: FailureId) -> Result<Option<WebhookFailureRecord>, FailureQueueError> {
        Ok(self.records.read().unwrap().get(&id).cloned())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookFailureRecord>, FailureQueueError> {
        let mut records = self.records.write().unwrap();

        let mut due: Vec<FailureId> = records
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| r.id)
            .collect();
        due.sort_by_key(|id| records[id].next_retry_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(record) = records.get_mut(&id) {
                if record.begin_attempt(now) {
                    claimed.push(record.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn update(&self, record: &WebhookFailureRecord) -> Result<(), FailureQueueError> {
        let mut records = self.records.write().unwrap();
        if !records.contains_key(&record.id) {
            return Err(FailureQueueError::NotFound(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        stall_after: Duration,
    ) -> Result<u64, FailureQueueError> {
        let cutoff = now - chrono::Duration::from_std(stall_after).unwrap_or_default();
        let mut records = self.records.write().unwrap();
        let mut recovered = 0;
        for record in records.values_mut() {
            if record.status == FailureStatus::Processing
                && record.last_attempt_at.is_some_and(|at| at < cutoff)
            {
                record.recover_stalled(now);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn list_by_status(
        &self,
        status: Option<FailureStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookFailureRecord>, FailureQueueError> {
        let records = self.records.read().unwrap();
        let mut result: Vec<_> = records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_dead_letter(
        &self,
        id: FailureId,
    ) -> Result<WebhookFailureRecord, FailureQueueError> {
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or(FailureQueueError::NotFound(id))?;
        if !record.reset_for_manual_retry(Utc::now()) {
            return Err(FailureQueueError::NotDeadLettered(id));
        }
        Ok(record.clone())
    }

    async fn stats(&self) -> Result<QueueStats, FailureQueueError> {
        let records = self.records.read().unwrap();
        let mut stats = QueueStats::default();
        for record in records.values() {
            match record.status {
                FailureStatus::Pending => stats.pending += 1,
                FailureStatus::Processing => stats.processing += 1,
                FailureStatus::Succeeded => stats.succeeded += 1,
                FailureStatus::DeadLetter => stats.dead_letter += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflow_webhooks::event::WebhookSource;
    use serde_json::json;

    fn record() -> WebhookFailureRecord {
        WebhookFailureRecord::new(
            WebhookSource::Payments,
            "checkout.completed",
            json!({"session_id": "cs_1"}),
            vec![],
            None,
        )
    }

    #[tokio::test]
    async fn enqueue_then_claim() {
        let store = InMemoryFailureQueue::new();
        let id = store.enqueue(record()).await.unwrap();

        let claimed = store.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, FailureStatus::Processing);

        // Already claimed; nothing left.
        assert!(store.claim_due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_each_record_once() {
        let store = InMemoryFailureQueue::arc();
        for _ in 0..8 {
            store.enqueue(record()).await.unwrap();
        }

        let (a, b) = tokio::join!(
            {
                let store = store.clone();
                async move { store.claim_due(Utc::now(), 8).await.unwrap() }
            },
            {
                let store = store.clone();
                async move { store.claim_due(Utc::now(), 8).await.unwrap() }
            },
        );

        let mut ids: Vec<FailureId> = a.iter().chain(b.iter()).map(|r| r.id).collect();
        let before = ids.len();
        ids.sort_by_key(|id| *id.as_uuid());
        ids.dedup();
        assert_eq!(ids.len(), before, "a record was claimed twice");
        assert_eq!(before, 8, "all records should be claimed exactly once");
    }

    #[tokio::test]
    async fn stalled_records_come_back_with_attempts_intact() {
        let store = InMemoryFailureQueue::new();
        let mut r = record();
        r.attempt_count = 2;
        let id = store.enqueue(r).await.unwrap();

        let now = Utc::now();
        store.claim_due(now, 1).await.unwrap();

        // Not stalled yet.
        let later = now + chrono::Duration::seconds(30);
        assert_eq!(
            store
                .recover_stalled(later, Duration::from_secs(60))
                .await
                .unwrap(),
            0
        );

        let much_later = now + chrono::Duration::seconds(120);
        assert_eq!(
            store
                .recover_stalled(much_later, Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );

        let recovered = store.get(id).await.unwrap().unwrap();
        assert_eq!(recovered.status, FailureStatus::Pending);
        assert_eq!(recovered.attempt_count, 2);
    }

    #[tokio::test]
    async fn retry_dead_letter_requires_dead_letter_state() {
        let store = InMemoryFailureQueue::new();
        let id = store.enqueue(record()).await.unwrap();

        assert!(matches!(
            store.retry_dead_letter(id).await,
            Err(FailureQueueError::NotDeadLettered(_))
        ));

        let mut r = store.get(id).await.unwrap().unwrap();
        r.status = FailureStatus::DeadLetter;
        store.update(&r).await.unwrap();

        let reset = store.retry_dead_letter(id).await.unwrap();
        assert_eq!(reset.status, FailureStatus::Pending);
        assert_eq!(reset.attempt_count, 0);
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let store = InMemoryFailureQueue::new();
        for _ in 0..3 {
            store.enqueue(record()).await.unwrap();
        }
        store.claim_due(Utc::now(), 1).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 1);
    }
}
