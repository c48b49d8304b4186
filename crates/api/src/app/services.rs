//! Infrastructure wiring behind the HTTP surface.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;

use inflow_infra::{
    CrmClientConfig, HttpCrmClient, PostgresCanonicalStore, PostgresFailureQueue,
    PostgresProcessedEvents, PostgresStagingStore, PostgresWatermarkStore, RetryScheduler,
    RetrySchedulerConfig, SyncWorker, WorkerHandle,
};
use inflow_sync::merge::{CrmJobMerger, MergeProcessor};
use inflow_sync::runner::{SyncConfig, SyncRunner};
use inflow_sync::store::WatermarkStore;
use inflow_sync::watermark::SyncType;
use inflow_webhooks::event::WebhookSource;
use inflow_webhooks::handler::{HandlerRegistry, WebhookHandler};
use inflow_webhooks::signature::SignatureVerifier;
use inflow_webhooks::store::FailureQueueStore;

use crate::app::handlers::RecordingWebhookHandler;
use crate::config::Config;

/// Everything route handlers need, bundled behind one `Extension`.
pub struct AppServices {
    pub verifiers: HashMap<WebhookSource, SignatureVerifier>,
    pub registry: Arc<HandlerRegistry>,
    pub failures: Arc<dyn FailureQueueStore>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub sync_runner: Arc<SyncRunner>,
    /// Retry budget stamped onto newly enqueued failure records.
    pub retry_max_attempts: u32,
}

/// Production wiring: Postgres stores, HTTP CRM client, one shared handler
/// registry for ingestion and redelivery.
pub fn build_services(config: &Config, pool: PgPool) -> anyhow::Result<AppServices> {
    let verifier_config = config.verifier_config();
    let verifiers = WebhookSource::ALL
        .into_iter()
        .map(|source| {
            (
                source,
                SignatureVerifier::new(config.webhook_secret(source), verifier_config),
            )
        })
        .collect();

    let processed = Arc::new(PostgresProcessedEvents::new(pool.clone()));
    let mut registry = HandlerRegistry::new();
    let handler: Arc<dyn WebhookHandler> = Arc::new(RecordingWebhookHandler::new(processed));
    for source in WebhookSource::ALL {
        registry.register(source, handler.clone());
    }
    let registry = Arc::new(registry);

    let failures: Arc<dyn FailureQueueStore> = Arc::new(PostgresFailureQueue::new(pool.clone()));

    let watermarks: Arc<dyn WatermarkStore> = Arc::new(PostgresWatermarkStore::new(pool.clone()));
    let staging = Arc::new(PostgresStagingStore::new(pool.clone()));
    let canonical = Arc::new(PostgresCanonicalStore::new(pool));

    let crm = HttpCrmClient::new(CrmClientConfig {
        base_url: config.crm_base_url.clone(),
        api_key: config.crm_api_key.clone(),
        timeout: config.crm_timeout,
        retry: config.retry_policy(),
        max_attempts: 3,
    })
    .map_err(|e| anyhow::anyhow!("crm client: {e}"))?;

    let mut sync_config = SyncConfig::new(SyncType::from("crm_jobs"));
    sync_config.page_size = config.sync_page_size;
    let merge = MergeProcessor::new(
        staging.clone(),
        Arc::new(CrmJobMerger::new(canonical)),
        config.sync_page_size as usize,
    );
    let sync_runner = Arc::new(SyncRunner::new(
        Arc::new(crm),
        watermarks.clone(),
        staging,
        merge,
        sync_config,
    ));

    Ok(AppServices {
        verifiers,
        registry,
        failures,
        watermarks,
        sync_runner,
        retry_max_attempts: config.retry_max_attempts,
    })
}

/// Spawn the background workers for a wired service bundle.
pub fn spawn_workers(config: &Config, services: &AppServices) -> Vec<WorkerHandle> {
    let scheduler = Arc::new(RetryScheduler::new(
        services.failures.clone(),
        services.registry.clone(),
        RetrySchedulerConfig {
            poll_interval: config.retry_poll_interval,
            stall_threshold: config.stall_threshold,
            retry_policy: config.retry_policy(),
            ..Default::default()
        },
    ));
    let sync = SyncWorker::new(services.sync_runner.clone(), config.sync_interval);

    vec![scheduler.spawn(), sync.spawn()]
}
