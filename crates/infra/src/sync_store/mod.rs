//! Watermark, staging, and canonical store implementations.
//!
//! The Postgres variants are production; the in-memory variants back unit
//! and integration tests with the same trait surface.

mod in_memory;
mod postgres;

pub use in_memory::{InMemoryCanonicalStore, InMemoryStagingStore, InMemoryWatermarkStore};
pub use postgres::{PostgresCanonicalStore, PostgresStagingStore, PostgresWatermarkStore};
