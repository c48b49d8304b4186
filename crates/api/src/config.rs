//! Environment configuration for the pipeline binary.

use std::time::Duration;

use anyhow::Context;

use inflow_webhooks::event::WebhookSource;
use inflow_webhooks::retry::RetryPolicy;
use inflow_webhooks::signature::VerifierConfig;

/// All runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,

    /// Per-provider webhook signing secrets.
    pub webhook_secret_payments: String,
    pub webhook_secret_email: String,
    pub webhook_secret_crm: String,
    pub signature_freshness: Duration,

    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_poll_interval: Duration,
    pub stall_threshold: Duration,

    pub sync_interval: Duration,
    pub sync_page_size: u32,
    pub crm_base_url: String,
    pub crm_api_key: String,
    pub crm_timeout: Duration,
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_addr: parse_or("BIND_ADDR", "0.0.0.0:8080".to_string())?,

            webhook_secret_payments: required("WEBHOOK_SECRET_PAYMENTS")?,
            webhook_secret_email: required("WEBHOOK_SECRET_EMAIL")?,
            webhook_secret_crm: required("WEBHOOK_SECRET_CRM")?,
            signature_freshness: Duration::from_secs(parse_or(
                "SIGNATURE_FRESHNESS_SECS",
                300u64,
            )?),

            retry_max_attempts: parse_or("RETRY_MAX_ATTEMPTS", 5u32)?,
            retry_base_delay: Duration::from_millis(parse_or("RETRY_BASE_DELAY_MS", 500u64)?),
            retry_max_delay: Duration::from_millis(parse_or("RETRY_MAX_DELAY_MS", 60_000u64)?),
            retry_poll_interval: Duration::from_secs(parse_or("RETRY_POLL_INTERVAL_SECS", 30u64)?),
            stall_threshold: Duration::from_secs(parse_or("STALL_THRESHOLD_SECS", 600u64)?),

            sync_interval: Duration::from_secs(parse_or("SYNC_INTERVAL_SECS", 900u64)?),
            sync_page_size: parse_or("SYNC_PAGE_SIZE", 100u32)?,
            crm_base_url: required("CRM_BASE_URL")?,
            crm_api_key: required("CRM_API_KEY")?,
            crm_timeout: Duration::from_secs(parse_or("CRM_TIMEOUT_SECS", 30u64)?),
        })
    }

    pub fn webhook_secret(&self, source: WebhookSource) -> &str {
        match source {
            WebhookSource::Payments => &self.webhook_secret_payments,
            WebhookSource::Email => &self.webhook_secret_email,
            WebhookSource::Crm => &self.webhook_secret_crm,
        }
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            freshness_window: self.signature_freshness,
            ..VerifierConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base_delay, self.retry_max_delay, 0.1)
    }
}
