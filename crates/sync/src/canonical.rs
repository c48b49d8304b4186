//! Canonical shape a staged CRM record merges into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::merge::MergeError;
use crate::staging::StagingRecord;

/// Canonical CRM job record, keyed by the source system's id.
///
/// Derived from staging rows only; merging the same staged payload twice
/// yields the same row state (upsert by `external_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmJob {
    pub external_id: String,
    pub title: String,
    pub status: String,
    pub customer_email: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub modified_on: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

/// Wire shape of a job as the CRM sends it.
#[derive(Debug, Deserialize)]
struct CrmJobWire {
    title: String,
    status: String,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    scheduled_for: Option<DateTime<Utc>>,
    modified_on: DateTime<Utc>,
}

impl CrmJob {
    /// Parse a staging row into the canonical shape.
    ///
    /// Failures here are permanent: the raw payload is immutable, so a
    /// payload that does not parse now never will.
    pub fn parse(record: &StagingRecord) -> Result<Self, MergeError> {
        let wire: CrmJobWire = serde_json::from_value(record.raw_data.clone())
            .map_err(|e| MergeError::Permanent(format!("unparseable job payload: {e}")))?;

        Ok(Self {
            external_id: record.external_id.clone(),
            title: wire.title,
            status: wire.status,
            customer_email: wire.customer_email,
            scheduled_for: wire.scheduled_for,
            modified_on: wire.modified_on,
            synced_at: Utc::now(),
        })
    }
}
