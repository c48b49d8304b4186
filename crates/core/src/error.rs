//! Pipeline error taxonomy.
//!
//! Every failure in the pipeline is classified into one of three buckets,
//! because the bucket decides what happens next:
//!
//! - `Untrusted`: the event cannot be trusted (bad signature, stale
//!   timestamp). Dropped immediately, never queued, never retried.
//! - `Transient`: infrastructure hiccup (timeout, connection reset, 5xx,
//!   database unavailable). Enqueued and retried with backoff.
//! - `Permanent`: will never succeed (unparseable payload, referenced
//!   entity genuinely absent). Dead-lettered immediately, no retry wasted.

use thiserror::Error;

/// Result type used across the pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Classified pipeline failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Input that failed authentication/freshness checks.
    #[error("untrusted input: {0}")]
    Untrusted(String),

    /// Recoverable infrastructure failure; safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable failure; retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl PipelineError {
    pub fn untrusted(msg: impl Into<String>) -> Self {
        Self::Untrusted(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether this failure should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retriable() {
        assert!(PipelineError::transient("timeout").is_transient());
        assert!(!PipelineError::permanent("bad payload").is_transient());
        assert!(!PipelineError::untrusted("bad signature").is_transient());
    }
}
