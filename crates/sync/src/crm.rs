//! Seam to the external CRM API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use inflow_core::PipelineResult;

/// One record from the CRM change stream.
#[derive(Debug, Clone)]
pub struct CrmRecord {
    pub external_id: String,
    /// Source-side modification time; drives the watermark.
    pub modified_on: DateTime<Utc>,
    /// Full payload, passed through to staging unmodified.
    pub data: serde_json::Value,
}

/// A page of CRM records.
#[derive(Debug, Clone)]
pub struct CrmPage {
    pub records: Vec<CrmRecord>,
    pub has_more: bool,
}

/// Paged access to the CRM's "records modified since T" endpoint.
///
/// The `since` boundary is inclusive (`modified_on >= since`): a record
/// modified exactly at the cursor may be re-fetched, which the idempotent
/// merge absorbs. The alternative (exclusive boundary on fetch-completion
/// time) risks silently skipping records modified during the fetch window.
///
/// Implementations must apply explicit request timeouts and surface rate
/// limiting (429) as a transient error after their own bounded backoff.
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn fetch_modified_since(
        &self,
        since: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> PipelineResult<CrmPage>;
}
