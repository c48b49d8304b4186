//! HTTP implementation of the CRM client.
//!
//! Error classification drives everything downstream: 429 and 5xx are
//! transient (the whole run retries later), any other non-success status
//! is permanent (retrying the same request cannot help). Transient statuses
//! get a short in-call retry loop before we give up on the run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::warn;

use inflow_core::{PipelineError, PipelineResult};
use inflow_sync::crm::{CrmClient, CrmPage, CrmRecord};
use inflow_webhooks::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct CrmClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    /// Backoff between in-call retries of a transient response.
    pub retry: RetryPolicy,
    /// In-call attempts per page fetch, including the first.
    pub max_attempts: u32,
}

impl CrmClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_attempts: 3,
        }
    }
}

/// Wire shape of the CRM's change-stream page.
#[derive(Debug, Deserialize)]
struct PageWire {
    records: Vec<RecordWire>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct RecordWire {
    id: String,
    modified_on: DateTime<Utc>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

pub struct HttpCrmClient {
    client: reqwest::Client,
    config: CrmClientConfig,
}

impl HttpCrmClient {
    pub fn new(config: CrmClientConfig) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::permanent(format!("build http client: {e}")))?;

        Ok(Self { client, config })
    }

    async fn fetch_page_once(
        &self,
        since: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> PipelineResult<CrmPage> {
        let mut request = self
            .client
            .get(format!("{}/records", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .query(&[("page", page.to_string()), ("page_size", page_size.to_string())]);
        if let Some(since) = since {
            request = request.query(&[("modified_since", since.to_rfc3339())]);
        }

        let response = request.send().await.map_err(|e| {
            // Timeouts and connection failures are retryable by nature.
            PipelineError::transient(format!("crm request failed: {e}"))
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(PipelineError::transient(format!(
                "crm returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::permanent(format!(
                "crm returned {status}"
            )));
        }

        let wire: PageWire = response
            .json()
            .await
            .map_err(|e| PipelineError::permanent(format!("unparseable crm page: {e}")))?;

        let records = wire
            .records
            .into_iter()
            .map(|r| {
                // Rebuild the full payload so staging keeps every field the
                // CRM sent, id and modified_on included.
                let mut data = r.rest;
                data.insert("id".into(), serde_json::Value::String(r.id.clone()));
                data.insert(
                    "modified_on".into(),
                    serde_json::Value::String(r.modified_on.to_rfc3339()),
                );
                CrmRecord {
                    external_id: r.id,
                    modified_on: r.modified_on,
                    data: serde_json::Value::Object(data),
                }
            })
            .collect();

        Ok(CrmPage {
            records,
            has_more: wire.has_more,
        })
    }
}

#[async_trait::async_trait]
impl CrmClient for HttpCrmClient {
    async fn fetch_modified_since(
        &self,
        since: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> PipelineResult<CrmPage> {
        let mut attempt = 1u32;
        loop {
            match self.fetch_page_once(since, page, page_size).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        page,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient crm fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
