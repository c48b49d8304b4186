//! Failure queue store implementations.
//!
//! The trait lives in `inflow_webhooks::store`; this module provides the
//! Postgres implementation used in production and an in-memory fake for
//! tests. Both honor the claim contract: `Pending → Processing` is atomic,
//! so concurrent schedulers never double-process a record.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryFailureQueue;
pub use postgres::PostgresFailureQueue;
