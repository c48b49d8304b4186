//! Merge processor: staging rows → canonical tables.
//!
//! Reads unprocessed staging rows and idempotently upserts them, recording
//! per-record success or failure without aborting the batch. One bad record
//! must not block the watermark for the rest of the run.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use inflow_core::StagingId;

use crate::canonical::CrmJob;
use crate::staging::StagingRecord;
use crate::store::{CanonicalStore, StagingStore, SyncStoreError};

/// Why a single staging row failed to merge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Store hiccup; the row stays NULL/NULL and is retried next run.
    #[error("transient merge failure: {0}")]
    Transient(String),
    /// Parse/transform/constraint failure; recorded as the row's terminal
    /// `processing_error`.
    #[error("permanent merge failure: {0}")]
    Permanent(String),
}

/// Merges one staging row into canonical state.
#[async_trait]
pub trait RecordMerger: Send + Sync {
    async fn merge(&self, record: &StagingRecord) -> Result<(), MergeError>;
}

/// Outcome of one merge pass over the staging table.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MergeReport {
    /// Rows upserted and marked `processed_at`.
    pub processed: u64,
    /// Rows settled with a terminal `processing_error`.
    pub failed: u64,
    /// Rows left NULL/NULL (transient failures); these block watermark
    /// advancement.
    pub unsettled: u64,
}

impl MergeReport {
    /// A run advances the watermark only when every staged row settled.
    pub fn fully_merged(&self) -> bool {
        self.unsettled == 0
    }
}

/// Batch driver over the staging store.
pub struct MergeProcessor {
    staging: Arc<dyn StagingStore>,
    merger: Arc<dyn RecordMerger>,
    batch_size: usize,
}

impl MergeProcessor {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        merger: Arc<dyn RecordMerger>,
        batch_size: usize,
    ) -> Self {
        Self {
            staging,
            merger,
            batch_size: batch_size.max(1),
        }
    }

    /// Merge every unprocessed staging row.
    ///
    /// Rows that fail transiently are attempted once per call and counted as
    /// unsettled; they reappear in the next run's pass.
    pub async fn process_all(&self) -> Result<MergeReport, SyncStoreError> {
        let mut report = MergeReport::default();
        let mut deferred: HashSet<StagingId> = HashSet::new();

        loop {
            let rows = self.staging.list_unprocessed(self.batch_size).await?;
            let fresh: Vec<StagingRecord> = rows
                .into_iter()
                .filter(|r| !deferred.contains(&r.id))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for row in fresh {
                match self.merger.merge(&row).await {
                    Ok(()) => {
                        self.staging.mark_processed(row.id, Utc::now()).await?;
                        report.processed += 1;
                    }
                    Err(MergeError::Permanent(error)) => {
                        warn!(
                            staging_id = %row.id,
                            external_id = %row.external_id,
                            error = %error,
                            "staging row failed permanently; isolating"
                        );
                        self.staging.mark_error(row.id, &error).await?;
                        report.failed += 1;
                    }
                    Err(MergeError::Transient(error)) => {
                        warn!(
                            staging_id = %row.id,
                            external_id = %row.external_id,
                            error = %error,
                            "staging row failed transiently; deferring to next run"
                        );
                        deferred.insert(row.id);
                        report.unsettled += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}

/// Default merger for CRM job records: parse, then upsert by external id.
pub struct CrmJobMerger {
    canonical: Arc<dyn CanonicalStore>,
}

impl CrmJobMerger {
    pub fn new(canonical: Arc<dyn CanonicalStore>) -> Self {
        Self { canonical }
    }
}

#[async_trait]
impl RecordMerger for CrmJobMerger {
    async fn merge(&self, record: &StagingRecord) -> Result<(), MergeError> {
        let job = CrmJob::parse(record)?;
        self.canonical
            .upsert(&job)
            .await
            .map_err(|e| MergeError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_gates_watermark_on_unsettled_rows() {
        let clean = MergeReport {
            processed: 97,
            failed: 3,
            unsettled: 0,
        };
        assert!(clean.fully_merged());

        let blocked = MergeReport {
            processed: 99,
            failed: 0,
            unsettled: 1,
        };
        assert!(!blocked.fully_merged());
    }
}
