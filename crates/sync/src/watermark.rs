//! Per-sync-type watermark.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of an external sync stream (one watermark row per type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncType(String);

impl SyncType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SyncType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyncType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Durable cursor for one sync stream.
///
/// `last_modified_on_fetched` is the actual resumption cursor: the maximum
/// source-side "modified" timestamp among records of the last fully merged
/// run. It is distinct from `last_successful_sync_at` (wall-clock run time)
/// and is monotonically non-decreasing across successful runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub sync_type: SyncType,
    /// Most recent fully committed run.
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    /// Resumption cursor; advances only after a run's staged rows are
    /// fully merged, never before.
    pub last_modified_on_fetched: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub sync_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    /// Single-run lock: a second run for this type is skipped while set.
    pub running: bool,
    pub run_started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SyncWatermark {
    /// Fresh watermark for a stream that has never synced.
    pub fn new(sync_type: SyncType) -> Self {
        Self {
            sync_type,
            last_successful_sync_at: None,
            last_modified_on_fetched: None,
            records_processed: 0,
            sync_duration_ms: None,
            last_error: None,
            last_error_at: None,
            running: false,
            run_started_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Monotone cursor advance; ignores candidates behind the current value.
    pub fn advance_cursor(&mut self, candidate: DateTime<Utc>) {
        match self.last_modified_on_fetched {
            Some(current) if current >= candidate => {}
            _ => self.last_modified_on_fetched = Some(candidate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cursor_never_regresses() {
        let mut wm = SyncWatermark::new(SyncType::from("crm_jobs"));
        let t1 = Utc::now();
        let t0 = t1 - Duration::hours(1);

        wm.advance_cursor(t1);
        wm.advance_cursor(t0);
        assert_eq!(wm.last_modified_on_fetched, Some(t1));

        let t2 = t1 + Duration::minutes(5);
        wm.advance_cursor(t2);
        assert_eq!(wm.last_modified_on_fetched, Some(t2));
    }
}
