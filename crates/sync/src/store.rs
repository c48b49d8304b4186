//! Storage abstractions for the sync side of the pipeline.
//!
//! Implementations live in `inflow-infra` (Postgres + in-memory fakes).
//! The sync runner only ever sees these traits, which is what makes the
//! watermark/staging/merge mechanics unit-testable without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use inflow_core::StagingId;

use crate::canonical::CrmJob;
use crate::staging::StagingRecord;
use crate::watermark::{SyncType, SyncWatermark};

/// Sync storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<SyncStoreError> for inflow_core::PipelineError {
    fn from(e: SyncStoreError) -> Self {
        // Store failures are infrastructure failures; the run retries later.
        inflow_core::PipelineError::transient(e.to_string())
    }
}

/// Durable watermark store, one row per sync type.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, sync_type: &SyncType) -> Result<Option<SyncWatermark>, SyncStoreError>;

    async fn get_or_create(&self, sync_type: &SyncType) -> Result<SyncWatermark, SyncStoreError>;

    /// Claim the single-run lock for this sync type.
    ///
    /// Returns the watermark when the claim wins; `None` when another run is
    /// already in flight. A lock older than `stale_after` (crashed runner)
    /// may be taken over. The claim must be an atomic conditional update.
    async fn try_begin_run(
        &self,
        sync_type: &SyncType,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Option<SyncWatermark>, SyncStoreError>;

    /// Commit a fully merged run: advance the cursor monotonically to
    /// `candidate` (when present), record diagnostics, release the lock.
    async fn complete_run(
        &self,
        sync_type: &SyncType,
        candidate: Option<DateTime<Utc>>,
        records_processed: u64,
        duration: Duration,
    ) -> Result<(), SyncStoreError>;

    /// Record a failed run and release the lock. The resumption cursor is
    /// left untouched so the same range is re-fetched next run.
    async fn fail_run(&self, sync_type: &SyncType, error: &str) -> Result<(), SyncStoreError>;
}

/// Durable staging-table store.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn stage(&self, records: Vec<StagingRecord>) -> Result<(), SyncStoreError>;

    /// Rows with neither `processed_at` nor `processing_error`, oldest first.
    async fn list_unprocessed(&self, limit: usize) -> Result<Vec<StagingRecord>, SyncStoreError>;

    async fn mark_processed(
        &self,
        id: StagingId,
        at: DateTime<Utc>,
    ) -> Result<(), SyncStoreError>;

    /// Record a terminal per-row error; the row stops blocking the watermark.
    async fn mark_error(&self, id: StagingId, error: &str) -> Result<(), SyncStoreError>;
}

/// Canonical-table store the merge processor upserts into.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Insert-if-absent, else update-in-place, keyed by `external_id`.
    async fn upsert(&self, job: &CrmJob) -> Result<(), SyncStoreError>;

    async fn get(&self, external_id: &str) -> Result<Option<CrmJob>, SyncStoreError>;

    async fn count(&self) -> Result<u64, SyncStoreError>;
}
