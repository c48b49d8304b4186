//! Failure queue storage abstraction.
//!
//! The queue is a durable table; implementations live in `inflow-infra`
//! (Postgres for production, in-memory for tests). The critical contract is
//! `claim_due`: the `Pending → Processing` transition must be atomic at the
//! storage layer so two scheduler instances racing on the same record
//! cannot both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use inflow_core::FailureId;

use crate::failure::{FailureStatus, WebhookFailureRecord};

/// Failure queue storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FailureQueueError {
    #[error("failure record not found: {0}")]
    NotFound(FailureId),
    #[error("record {0} is not in dead_letter state")]
    NotDeadLettered(FailureId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Queue depth by status, for operator visibility.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub dead_letter: u64,
}

/// Durable store for webhook failure records.
#[async_trait]
pub trait FailureQueueStore: Send + Sync {
    /// Persist a new record. Enqueueing is what makes a failed webhook
    /// "durably accepted" — callers must not acknowledge the provider
    /// before this returns.
    async fn enqueue(&self, record: WebhookFailureRecord) -> Result<FailureId, FailureQueueError>;

    async fn get(&self, id: FailureId) -> Result<Option<WebhookFailureRecord>, FailureQueueError>;

    /// Atomically claim up to `limit` due records (`Pending`,
    /// `next_retry_at <= now`), transitioning each to `Processing`.
    /// Two concurrent callers never receive the same record.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookFailureRecord>, FailureQueueError>;

    /// Persist the post-attempt state of a claimed record.
    async fn update(&self, record: &WebhookFailureRecord) -> Result<(), FailureQueueError>;

    /// Reset records stuck in `Processing` longer than `stall_after` back to
    /// `Pending`, preserving their attempt counts. Returns how many were
    /// recovered.
    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        stall_after: Duration,
    ) -> Result<u64, FailureQueueError>;

    /// List records, optionally filtered by status, newest first.
    async fn list_by_status(
        &self,
        status: Option<FailureStatus>,
        limit: usize,
    ) -> Result<Vec<WebhookFailureRecord>, FailureQueueError>;

    /// Operator reset of a dead letter back to `Pending` with a fresh retry
    /// budget. Fails with `NotDeadLettered` for records in any other state.
    async fn retry_dead_letter(
        &self,
        id: FailureId,
    ) -> Result<WebhookFailureRecord, FailureQueueError>;

    async fn stats(&self) -> Result<QueueStats, FailureQueueError>;
}
