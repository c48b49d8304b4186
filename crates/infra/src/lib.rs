//! `inflow-infra` — storage and runtime infrastructure for the pipeline.
//!
//! Postgres implementations (sqlx) of the store traits defined in
//! `inflow-webhooks` and `inflow-sync`, in-memory fakes for tests, the two
//! background workers (retry scheduler, sync runner), and the outbound CRM
//! client. The schema for all tables lives in `schema.sql`.

pub mod crm;
pub mod failure_store;
pub mod processed_events;
pub mod sync_store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use crm::{CrmClientConfig, HttpCrmClient};
pub use failure_store::{InMemoryFailureQueue, PostgresFailureQueue};
pub use processed_events::{InMemoryProcessedEvents, PostgresProcessedEvents, ProcessedEventStore};
pub use sync_store::{
    InMemoryCanonicalStore, InMemoryStagingStore, InMemoryWatermarkStore, PostgresCanonicalStore,
    PostgresStagingStore, PostgresWatermarkStore,
};
pub use workers::{RetryScheduler, RetrySchedulerConfig, SyncWorker, TickSummary, WorkerHandle};
