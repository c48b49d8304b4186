//! Periodic CRM sync worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use inflow_sync::runner::{SyncOutcome, SyncRunner};

use super::WorkerHandle;

/// Drives a [`SyncRunner`] on a fixed interval.
///
/// Overlap protection lives in the watermark lock, not here: if a run
/// outlasts the interval, the next invocation observes `AlreadyRunning`
/// and skips.
pub struct SyncWorker {
    runner: Arc<SyncRunner>,
    interval: Duration,
}

impl SyncWorker {
    pub fn new(runner: Arc<SyncRunner>, interval: Duration) -> Self {
        Self { runner, interval }
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let SyncWorker { runner, interval } = self;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                sync_type = %runner.sync_type(),
                interval_secs = interval.as_secs(),
                "sync worker started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match runner.run().await {
                            Ok(SyncOutcome::Completed(report)) => info!(
                                sync_type = %runner.sync_type(),
                                fetched = report.fetched,
                                merged = report.merge.processed,
                                failed = report.merge.failed,
                                duration_ms = report.duration_ms,
                                "sync run complete"
                            ),
                            Ok(SyncOutcome::AlreadyRunning) => info!(
                                sync_type = %runner.sync_type(),
                                "sync already in flight, skipping"
                            ),
                            Err(e) => error!(
                                sync_type = %runner.sync_type(),
                                error = %e,
                                "sync run failed"
                            ),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!(sync_type = %runner.sync_type(), "sync worker stopping");
                        break;
                    }
                }
            }
        });

        WorkerHandle::new("sync-worker", shutdown_tx, join)
    }
}
