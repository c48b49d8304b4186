//! `inflow-core` — shared primitives for the event pipeline.
//!
//! This crate contains **pure domain** building blocks (no infrastructure
//! concerns): typed identifiers and the pipeline error taxonomy.

pub mod error;
pub mod id;

pub use error::{PipelineError, PipelineResult};
pub use id::{FailureId, StagingId};
