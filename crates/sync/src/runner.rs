//! Sync run orchestration.
//!
//! One run: claim the single-run lock, page the CRM change stream from the
//! cursor, stage everything raw, merge, and only then advance the
//! watermark. An interrupted run leaves the cursor untouched; the same
//! range is re-fetched next time and the idempotent merge absorbs the
//! overlap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use inflow_core::{PipelineError, PipelineResult};

use crate::crm::CrmClient;
use crate::merge::{MergeProcessor, MergeReport};
use crate::staging::StagingRecord;
use crate::store::{StagingStore, WatermarkStore};
use crate::watermark::SyncType;

/// Sync run parameters.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sync_type: SyncType,
    pub page_size: u32,
    /// Cursor used on the very first run, before any watermark exists.
    /// `None` means "from the beginning of the stream".
    pub epoch: Option<DateTime<Utc>>,
    /// A run lock older than this is considered abandoned and taken over.
    pub stale_run_takeover: Duration,
}

impl SyncConfig {
    pub fn new(sync_type: SyncType) -> Self {
        Self {
            sync_type,
            page_size: 100,
            epoch: None,
            stale_run_takeover: Duration::from_secs(30 * 60),
        }
    }
}

/// What a triggered run did.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another run holds the lock for this sync type; nothing was done.
    AlreadyRunning,
}

/// Diagnostics for a completed run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncReport {
    pub fetched: u64,
    pub merge: MergeReport,
    /// Cursor value committed by this run; `None` when the run fetched
    /// nothing or was blocked by unsettled rows.
    pub watermark_advanced_to: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// Orchestrates one sync stream against injected stores.
pub struct SyncRunner {
    client: Arc<dyn CrmClient>,
    watermarks: Arc<dyn WatermarkStore>,
    staging: Arc<dyn StagingStore>,
    merge: MergeProcessor,
    config: SyncConfig,
}

impl SyncRunner {
    pub fn new(
        client: Arc<dyn CrmClient>,
        watermarks: Arc<dyn WatermarkStore>,
        staging: Arc<dyn StagingStore>,
        merge: MergeProcessor,
        config: SyncConfig,
    ) -> Self {
        Self {
            client,
            watermarks,
            staging,
            merge,
            config,
        }
    }

    pub fn sync_type(&self) -> &SyncType {
        &self.config.sync_type
    }

    /// Execute one run end to end.
    pub async fn run(&self) -> PipelineResult<SyncOutcome> {
        let sync_type = &self.config.sync_type;
        self.watermarks.get_or_create(sync_type).await?;

        let now = Utc::now();
        let Some(watermark) = self
            .watermarks
            .try_begin_run(sync_type, now, self.config.stale_run_takeover)
            .await?
        else {
            info!(sync_type = %sync_type, "sync already running, skipping");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let started = Instant::now();
        let cursor = watermark.last_modified_on_fetched.or(self.config.epoch);

        match self.execute(cursor, started).await {
            Ok(report) => {
                info!(
                    sync_type = %sync_type,
                    fetched = report.fetched,
                    processed = report.merge.processed,
                    failed = report.merge.failed,
                    unsettled = report.merge.unsettled,
                    duration_ms = report.duration_ms,
                    "sync run finished"
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                warn!(sync_type = %sync_type, error = %e, "sync run failed");
                if let Err(release) = self.watermarks.fail_run(sync_type, &e.to_string()).await {
                    warn!(sync_type = %sync_type, error = %release, "failed to record sync failure");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        cursor: Option<DateTime<Utc>>,
        started: Instant,
    ) -> PipelineResult<SyncReport> {
        let sync_type = &self.config.sync_type;

        // Fetch phase: page the change stream, staging each page raw.
        // candidate = max(modified_on) across the whole page set.
        let mut candidate: Option<DateTime<Utc>> = None;
        let mut fetched: u64 = 0;
        let mut page: u32 = 0;

        loop {
            let crm_page = self
                .client
                .fetch_modified_since(cursor, page, self.config.page_size)
                .await?;

            for record in &crm_page.records {
                candidate = match candidate {
                    Some(c) if c >= record.modified_on => Some(c),
                    _ => Some(record.modified_on),
                };
            }
            fetched += crm_page.records.len() as u64;

            let batch: Vec<StagingRecord> =
                crm_page.records.iter().map(StagingRecord::from_crm).collect();
            if !batch.is_empty() {
                self.staging.stage(batch).await?;
            }

            if !crm_page.has_more || crm_page.records.is_empty() {
                break;
            }
            page += 1;
        }

        // Merge phase: settle every staged row we can.
        let merge = self.merge.process_all().await?;

        if merge.fully_merged() {
            self.watermarks
                .complete_run(sync_type, candidate, merge.processed, started.elapsed())
                .await?;
            Ok(SyncReport {
                fetched,
                watermark_advanced_to: candidate,
                duration_ms: started.elapsed().as_millis() as u64,
                merge,
            })
        } else {
            // Unsettled rows block advancement; the cursor stays put and the
            // lock is released via the failure path.
            Err(PipelineError::transient(format!(
                "{} staged rows unsettled; watermark not advanced",
                merge.unsettled
            )))
        }
    }
}
