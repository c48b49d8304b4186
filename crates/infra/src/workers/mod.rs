//! Background workers: retry redelivery and periodic CRM sync.

mod handle;
mod retry_scheduler;
mod sync_worker;

pub use handle::WorkerHandle;
pub use retry_scheduler::{RetryScheduler, RetrySchedulerConfig, TickSummary};
pub use sync_worker::SyncWorker;
