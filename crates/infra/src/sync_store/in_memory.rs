//! In-memory sync stores for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use inflow_core::StagingId;
use inflow_sync::canonical::CrmJob;
use inflow_sync::staging::StagingRecord;
use inflow_sync::store::{CanonicalStore, StagingStore, SyncStoreError, WatermarkStore};
use inflow_sync::watermark::{SyncType, SyncWatermark};

/// Watermark store backed by a `HashMap`, lock semantics matching the
/// Postgres conditional update.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWatermarkStore {
    rows: Arc<RwLock<HashMap<SyncType, SyncWatermark>>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn get(&self, sync_type: &SyncType) -> Result<Option<SyncWatermark>, SyncStoreError> {
        Ok(self.rows.read().await.get(sync_type).cloned())
    }

    async fn get_or_create(&self, sync_type: &SyncType) -> Result<SyncWatermark, SyncStoreError> {
        let mut rows = self.rows.write().await;
        Ok(rows
            .entry(sync_type.clone())
            .or_insert_with(|| SyncWatermark::new(sync_type.clone()))
            .clone())
    }

    async fn try_begin_run(
        &self,
        sync_type: &SyncType,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Option<SyncWatermark>, SyncStoreError> {
        let mut rows = self.rows.write().await;
        let wm = rows
            .get_mut(sync_type)
            .ok_or_else(|| SyncStoreError::NotFound(sync_type.to_string()))?;

        let stale_cutoff = now - chrono::Duration::from_std(stale_after).unwrap_or_default();
        let claimable = !wm.running
            || wm.run_started_at.is_none_or(|started| started < stale_cutoff);
        if !claimable {
            return Ok(None);
        }

        wm.running = true;
        wm.run_started_at = Some(now);
        wm.updated_at = now;
        Ok(Some(wm.clone()))
    }

    async fn complete_run(
        &self,
        sync_type: &SyncType,
        candidate: Option<DateTime<Utc>>,
        records_processed: u64,
        duration: Duration,
    ) -> Result<(), SyncStoreError> {
        let mut rows = self.rows.write().await;
        let wm = rows
            .get_mut(sync_type)
            .ok_or_else(|| SyncStoreError::NotFound(sync_type.to_string()))?;

        let now = Utc::now();
        if let Some(candidate) = candidate {
            wm.advance_cursor(candidate);
        }
        wm.last_successful_sync_at = Some(now);
        wm.records_processed = records_processed;
        wm.sync_duration_ms = Some(duration.as_millis() as u64);
        wm.last_error = None;
        wm.running = false;
        wm.run_started_at = None;
        wm.updated_at = now;
        Ok(())
    }

    async fn fail_run(&self, sync_type: &SyncType, error: &str) -> Result<(), SyncStoreError> {
        let mut rows = self.rows.write().await;
        let wm = rows
            .get_mut(sync_type)
            .ok_or_else(|| SyncStoreError::NotFound(sync_type.to_string()))?;

        let now = Utc::now();
        wm.last_error = Some(error.to_string());
        wm.last_error_at = Some(now);
        wm.running = false;
        wm.run_started_at = None;
        wm.updated_at = now;
        Ok(())
    }
}

/// Staging store backed by an insertion-ordered `Vec`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStagingStore {
    rows: Arc<RwLock<Vec<StagingRecord>>>,
}

impl InMemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, settled or not. Test-side inspection only.
    pub async fn all(&self) -> Vec<StagingRecord> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl StagingStore for InMemoryStagingStore {
    async fn stage(&self, records: Vec<StagingRecord>) -> Result<(), SyncStoreError> {
        self.rows.write().await.extend(records);
        Ok(())
    }

    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<StagingRecord>, SyncStoreError> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|r| !r.is_settled())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(
        &self,
        id: StagingId,
        at: DateTime<Utc>,
    ) -> Result<(), SyncStoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| SyncStoreError::NotFound(id.to_string()))?;
        row.processed_at = Some(at);
        Ok(())
    }

    async fn mark_error(&self, id: StagingId, error: &str) -> Result<(), SyncStoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| SyncStoreError::NotFound(id.to_string()))?;
        row.processing_error = Some(error.to_string());
        Ok(())
    }
}

/// Canonical store backed by a `HashMap` keyed on `external_id`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCanonicalStore {
    rows: Arc<RwLock<HashMap<String, CrmJob>>>,
}

impl InMemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CanonicalStore for InMemoryCanonicalStore {
    async fn upsert(&self, job: &CrmJob) -> Result<(), SyncStoreError> {
        self.rows
            .write()
            .await
            .insert(job.external_id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, external_id: &str) -> Result<Option<CrmJob>, SyncStoreError> {
        Ok(self.rows.read().await.get(external_id).cloned())
    }

    async fn count(&self) -> Result<u64, SyncStoreError> {
        Ok(self.rows.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn jobs_type() -> SyncType {
        SyncType::from("crm_jobs")
    }

    #[tokio::test]
    async fn begin_run_is_mutually_exclusive() {
        let store = InMemoryWatermarkStore::new();
        store.get_or_create(&jobs_type()).await.unwrap();

        let now = Utc::now();
        let stale = Duration::from_secs(1800);
        let first = store.try_begin_run(&jobs_type(), now, stale).await.unwrap();
        let second = store.try_begin_run(&jobs_type(), now, stale).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let store = InMemoryWatermarkStore::new();
        store.get_or_create(&jobs_type()).await.unwrap();

        let crashed_at = Utc::now() - chrono::Duration::hours(2);
        store
            .try_begin_run(&jobs_type(), crashed_at, Duration::from_secs(1800))
            .await
            .unwrap()
            .unwrap();

        // The crashed run never releases; a fresh run claims past it.
        let takeover = store
            .try_begin_run(&jobs_type(), Utc::now(), Duration::from_secs(1800))
            .await
            .unwrap();
        assert!(takeover.is_some());
    }

    #[tokio::test]
    async fn complete_run_never_moves_cursor_backwards() {
        let store = InMemoryWatermarkStore::new();
        store.get_or_create(&jobs_type()).await.unwrap();

        let t2 = Utc::now();
        let t1 = t2 - chrono::Duration::hours(1);

        store
            .complete_run(&jobs_type(), Some(t2), 10, Duration::from_secs(1))
            .await
            .unwrap();
        store
            .complete_run(&jobs_type(), Some(t1), 3, Duration::from_secs(1))
            .await
            .unwrap();

        let wm = store.get(&jobs_type()).await.unwrap().unwrap();
        assert_eq!(wm.last_modified_on_fetched, Some(t2));
    }

    #[tokio::test]
    async fn failed_run_releases_lock_and_keeps_cursor() {
        let store = InMemoryWatermarkStore::new();
        store.get_or_create(&jobs_type()).await.unwrap();

        let t1 = Utc::now();
        store
            .complete_run(&jobs_type(), Some(t1), 5, Duration::from_secs(1))
            .await
            .unwrap();

        store
            .try_begin_run(&jobs_type(), Utc::now(), Duration::from_secs(1800))
            .await
            .unwrap()
            .unwrap();
        store.fail_run(&jobs_type(), "upstream 503").await.unwrap();

        let wm = store.get(&jobs_type()).await.unwrap().unwrap();
        assert!(!wm.running);
        assert_eq!(wm.last_error.as_deref(), Some("upstream 503"));
        assert_eq!(wm.last_modified_on_fetched, Some(t1));
    }

    #[tokio::test]
    async fn canonical_upsert_is_idempotent() {
        let store = InMemoryCanonicalStore::new();
        let row = StagingRecord::new(
            "J-9",
            json!({
                "title": "Fence install",
                "status": "scheduled",
                "modified_on": "2026-08-10T09:00:00Z"
            }),
        );
        let job = CrmJob::parse(&row).unwrap();

        store.upsert(&job).await.unwrap();
        store.upsert(&job).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.get("J-9").await.unwrap().unwrap();
        assert_eq!(stored.title, "Fence install");
    }

    #[tokio::test]
    async fn unprocessed_listing_skips_settled_rows() {
        let store = InMemoryStagingStore::new();
        let a = StagingRecord::new("A", json!({}));
        let b = StagingRecord::new("B", json!({}));
        let a_id = a.id;
        store.stage(vec![a, b]).await.unwrap();

        store.mark_processed(a_id, Utc::now()).await.unwrap();

        let unprocessed = store.list_unprocessed(10).await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].external_id, "B");
    }
}
