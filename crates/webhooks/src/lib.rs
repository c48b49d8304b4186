//! `inflow-webhooks` — inbound webhook ingestion building blocks.
//!
//! Covers everything between "raw bytes arrived" and "durably accepted":
//! signature verification, the typed event envelope, the failure-queue
//! record with its retry state machine, and the handler seam that both
//! inline ingestion and the retry scheduler dispatch through.

pub mod event;
pub mod failure;
pub mod handler;
pub mod retry;
pub mod signature;
pub mod store;

pub use event::{EventKind, WebhookEvent, WebhookSource};
pub use failure::{AttemptOutcome, FailureStatus, WebhookFailureRecord, DEFAULT_MAX_ATTEMPTS};
pub use handler::{HandlerRegistry, WebhookHandler};
pub use retry::RetryPolicy;
pub use signature::{SignatureError, SignatureVerifier, VerifierConfig};
pub use store::{FailureQueueStore, FailureQueueError, QueueStats};
