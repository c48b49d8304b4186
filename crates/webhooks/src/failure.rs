//! Webhook failure-queue record and its retry state machine.
//!
//! A record is created when inline processing of a *verified* webhook fails
//! transiently. From then on only the retry scheduler mutates it, through
//! the transitions here:
//!
//! `Pending → Processing → { Succeeded | Pending(retry) | DeadLetter }`
//!
//! Records are never deleted automatically; terminal records stay queryable
//! for audit and manual intervention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use inflow_core::FailureId;

use crate::event::{WebhookEvent, WebhookSource};
use crate::retry::RetryPolicy;

/// Default retry budget for a failure record.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Lifecycle state of a failure record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    /// Waiting for its `next_retry_at` to come due.
    Pending,
    /// Claimed by a scheduler instance; an attempt is in flight.
    Processing,
    /// Redelivery succeeded. Terminal.
    Succeeded,
    /// Retry budget exhausted or failure judged permanent. Terminal.
    DeadLetter,
}

impl FailureStatus {
    /// Terminal records must never be picked up by the scheduler again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureStatus::Succeeded | FailureStatus::DeadLetter)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStatus::Pending => "pending",
            FailureStatus::Processing => "processing",
            FailureStatus::Succeeded => "succeeded",
            FailureStatus::DeadLetter => "dead_letter",
        }
    }
}

impl std::str::FromStr for FailureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FailureStatus::Pending),
            "processing" => Ok(FailureStatus::Processing),
            "succeeded" => Ok(FailureStatus::Succeeded),
            "dead_letter" => Ok(FailureStatus::DeadLetter),
            other => Err(format!("unknown failure status: {other}")),
        }
    }
}

/// Result of one redelivery attempt, as reported by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Infrastructure failure; retry with backoff if budget remains.
    Transient(String),
    /// Business/parse failure; dead-letter immediately, no retry wasted.
    Permanent(String),
}

/// A webhook delivery that could not be processed inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookFailureRecord {
    pub id: FailureId,
    pub source: WebhookSource,
    pub event_name: String,
    /// Full original body, preserved so redelivery re-runs the exact same
    /// handler logic.
    pub raw_payload: serde_json::Value,
    /// Original request headers, kept for audit/replay.
    pub headers: Vec<(String, String)>,
    pub signature: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: FailureStatus,
    /// Immutable creation time.
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub moved_to_dead_letter_at: Option<DateTime<Utc>>,
}

impl WebhookFailureRecord {
    /// Create a pending record scheduled for an immediate first retry.
    pub fn new(
        source: WebhookSource,
        event_name: impl Into<String>,
        raw_payload: serde_json::Value,
        headers: Vec<(String, String)>,
        signature: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: FailureId::new(),
            source,
            event_name: event_name.into(),
            raw_payload,
            headers,
            signature,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_retry_at: Some(now),
            last_attempt_at: None,
            last_error: None,
            status: FailureStatus::Pending,
            received_at: now,
            processed_at: None,
            moved_to_dead_letter_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Rebuild the event envelope for redelivery.
    pub fn event(&self) -> WebhookEvent {
        WebhookEvent::new(self.source, self.event_name.clone(), self.raw_payload.clone())
    }

    /// Whether the scheduler should claim this record now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == FailureStatus::Pending
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Claim transition: `Pending → Processing`.
    ///
    /// In persistent stores this is performed as an atomic conditional
    /// update; this method is the in-process counterpart used by the
    /// in-memory store and by tests.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != FailureStatus::Pending {
            return false;
        }
        self.status = FailureStatus::Processing;
        self.last_attempt_at = Some(now);
        true
    }

    /// Resolve an in-flight attempt.
    ///
    /// Terminal records are left untouched: once `Succeeded` or
    /// `DeadLetter`, no outcome may change status or attempt count.
    pub fn resolve(&mut self, outcome: AttemptOutcome, policy: &RetryPolicy, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }

        match outcome {
            AttemptOutcome::Success => {
                self.status = FailureStatus::Succeeded;
                self.processed_at = Some(now);
                self.next_retry_at = None;
            }
            AttemptOutcome::Transient(error) => {
                self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
                self.last_error = Some(error);
                if self.attempt_count < self.max_attempts {
                    let delay = policy.delay_for_attempt(self.attempt_count);
                    self.next_retry_at =
                        Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
                    self.status = FailureStatus::Pending;
                } else {
                    self.move_to_dead_letter(now);
                }
            }
            AttemptOutcome::Permanent(error) => {
                self.last_error = Some(error);
                self.move_to_dead_letter(now);
            }
        }
    }

    /// Stall recovery: `Processing → Pending` without touching the attempt
    /// count, so backoff is not reset by a scheduler crash.
    pub fn recover_stalled(&mut self, now: DateTime<Utc>) {
        if self.status == FailureStatus::Processing {
            self.status = FailureStatus::Pending;
            self.next_retry_at = Some(now);
        }
    }

    /// Operator-initiated reset of a dead letter back to the queue.
    ///
    /// This is the only sanctioned exit from `DeadLetter`; it resets the
    /// retry budget so the record gets a full set of attempts again.
    pub fn reset_for_manual_retry(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != FailureStatus::DeadLetter {
            return false;
        }
        self.status = FailureStatus::Pending;
        self.attempt_count = 0;
        self.next_retry_at = Some(now);
        self.last_error = None;
        self.moved_to_dead_letter_at = None;
        true
    }

    fn move_to_dead_letter(&mut self, now: DateTime<Utc>) {
        self.status = FailureStatus::DeadLetter;
        self.moved_to_dead_letter_at = Some(now);
        self.next_retry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn record() -> WebhookFailureRecord {
        WebhookFailureRecord::new(
            WebhookSource::Payments,
            "checkout.completed",
            json!({"session_id": "cs_1", "amount_cents": 100}),
            vec![("x-webhook-timestamp".into(), "123".into())],
            Some("sha256=ab".into()),
        )
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::without_jitter(Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn new_record_is_due_immediately() {
        let r = record();
        assert_eq!(r.status, FailureStatus::Pending);
        assert_eq!(r.attempt_count, 0);
        assert!(r.is_due(Utc::now()));
    }

    #[test]
    fn transient_failures_reschedule_with_growing_backoff() {
        let mut r = record();
        let now = Utc::now();

        assert!(r.begin_attempt(now));
        r.resolve(AttemptOutcome::Transient("timeout".into()), &policy(), now);

        assert_eq!(r.status, FailureStatus::Pending);
        assert_eq!(r.attempt_count, 1);
        let first_retry = r.next_retry_at.unwrap();
        assert!(first_retry > now);

        assert!(!r.is_due(now), "backoff must delay the next claim");

        r.begin_attempt(first_retry);
        r.resolve(
            AttemptOutcome::Transient("timeout".into()),
            &policy(),
            first_retry,
        );
        let second_gap = r.next_retry_at.unwrap() - first_retry;
        assert!(second_gap > first_retry - now);
    }

    #[test]
    fn attempt_count_never_exceeds_max_before_dead_letter() {
        let mut r = record().with_max_attempts(5);
        let p = policy();

        for _ in 0..5 {
            assert!(r.attempt_count <= r.max_attempts);
            let now = Utc::now();
            r.next_retry_at = Some(now);
            assert!(r.begin_attempt(now));
            r.resolve(AttemptOutcome::Transient("down".into()), &p, now);
        }

        assert_eq!(r.attempt_count, 5);
        assert_eq!(r.status, FailureStatus::DeadLetter);
        assert!(r.moved_to_dead_letter_at.is_some());
    }

    #[test]
    fn permanent_failure_dead_letters_on_first_attempt() {
        let mut r = record();
        let now = Utc::now();

        r.begin_attempt(now);
        r.resolve(AttemptOutcome::Permanent("unparseable".into()), &policy(), now);

        assert_eq!(r.status, FailureStatus::DeadLetter);
        assert_eq!(r.attempt_count, 0);
        assert_eq!(r.last_error.as_deref(), Some("unparseable"));
    }

    #[test]
    fn terminal_states_are_frozen() {
        let p = policy();
        let now = Utc::now();

        let mut succeeded = record();
        succeeded.begin_attempt(now);
        succeeded.resolve(AttemptOutcome::Success, &p, now);
        let snapshot = (succeeded.status, succeeded.attempt_count);
        succeeded.resolve(AttemptOutcome::Transient("late".into()), &p, now);
        succeeded.resolve(AttemptOutcome::Permanent("late".into()), &p, now);
        assert_eq!((succeeded.status, succeeded.attempt_count), snapshot);

        let mut dead = record();
        dead.begin_attempt(now);
        dead.resolve(AttemptOutcome::Permanent("bad".into()), &p, now);
        dead.resolve(AttemptOutcome::Success, &p, now);
        assert_eq!(dead.status, FailureStatus::DeadLetter);
        assert!(!dead.begin_attempt(now), "dead letters are not claimable");
    }

    #[test]
    fn stall_recovery_preserves_attempt_count() {
        let mut r = record();
        let now = Utc::now();
        r.begin_attempt(now);
        r.resolve(AttemptOutcome::Transient("x".into()), &policy(), now);
        r.next_retry_at = Some(now);
        r.begin_attempt(now);
        assert_eq!(r.status, FailureStatus::Processing);

        r.recover_stalled(now);
        assert_eq!(r.status, FailureStatus::Pending);
        assert_eq!(r.attempt_count, 1);
    }

    #[test]
    fn manual_retry_is_the_only_exit_from_dead_letter() {
        let mut r = record();
        let now = Utc::now();
        r.begin_attempt(now);
        r.resolve(AttemptOutcome::Permanent("bad".into()), &policy(), now);

        assert!(r.reset_for_manual_retry(now));
        assert_eq!(r.status, FailureStatus::Pending);
        assert_eq!(r.attempt_count, 0);
        assert!(r.moved_to_dead_letter_at.is_none());

        // Reset on a non-dead-letter record is a no-op.
        assert!(!r.reset_for_manual_retry(now));
    }

    #[test]
    fn envelope_rebuild_preserves_the_payload() {
        let r = record();
        let event = r.event();
        assert_eq!(event.source, WebhookSource::Payments);
        assert_eq!(event.payload, r.raw_payload);
    }
}
