//! Staging rows: the durable landing buffer for fetched CRM records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use inflow_core::StagingId;

use crate::crm::CrmRecord;

/// One raw record as fetched from the external CRM.
///
/// `external_id` is the source system's primary key and is *not* unique
/// across fetches: a re-fetch after an interrupted run re-stages the same
/// record, which is why the merge step upserts by `external_id`. Staging
/// rows are a buffer, never the system of record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: StagingId,
    pub external_id: String,
    /// Full unmodified payload from the external API.
    pub raw_data: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
}

impl StagingRecord {
    pub fn new(external_id: impl Into<String>, raw_data: serde_json::Value) -> Self {
        Self {
            id: StagingId::new(),
            external_id: external_id.into(),
            raw_data,
            fetched_at: Utc::now(),
            processed_at: None,
            processing_error: None,
        }
    }

    pub fn from_crm(record: &CrmRecord) -> Self {
        Self::new(record.external_id.clone(), record.data.clone())
    }

    /// A settled row no longer blocks watermark advancement: it either
    /// merged successfully or carries a terminal error.
    pub fn is_settled(&self) -> bool {
        self.processed_at.is_some() || self.processing_error.is_some()
    }
}
