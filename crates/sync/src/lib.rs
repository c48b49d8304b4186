//! `inflow-sync` — watermark-driven incremental CRM synchronization.
//!
//! The sync side of the pipeline: a persisted per-sync-type watermark marks
//! the last fully incorporated point in the external change stream, fetched
//! records land raw in a staging table, and a merge processor upserts them
//! into the canonical store idempotently. The watermark only advances after
//! a run's staged rows are fully merged, so partial failures never corrupt
//! the canonical data — the same range is simply re-fetched next run.

pub mod canonical;
pub mod crm;
pub mod merge;
pub mod runner;
pub mod staging;
pub mod store;
pub mod watermark;

pub use canonical::CrmJob;
pub use crm::{CrmClient, CrmPage, CrmRecord};
pub use merge::{MergeError, MergeProcessor, MergeReport, RecordMerger};
pub use runner::{SyncConfig, SyncOutcome, SyncReport, SyncRunner};
pub use staging::StagingRecord;
pub use store::{CanonicalStore, StagingStore, SyncStoreError, WatermarkStore};
pub use watermark::{SyncType, SyncWatermark};
