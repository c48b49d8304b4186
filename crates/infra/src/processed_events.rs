//! Idempotency ledger for webhook handlers.
//!
//! External providers redeliver: the same event can arrive twice from the
//! provider, and again from our own retry queue. `record_once` claims the
//! `(source, event_id)` pair atomically; only the caller that gets `true`
//! applies side effects.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;

use inflow_core::{PipelineError, PipelineResult};
use inflow_webhooks::event::WebhookSource;

#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Record the event as processed. Returns `true` when this call claimed
    /// it, `false` when it was already recorded (duplicate delivery).
    async fn record_once(
        &self,
        source: WebhookSource,
        event_id: &str,
        event_name: &str,
        payload: &serde_json::Value,
    ) -> PipelineResult<bool>;
}

#[derive(Debug, Clone)]
pub struct PostgresProcessedEvents {
    pool: Arc<PgPool>,
}

impl PostgresProcessedEvents {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ProcessedEventStore for PostgresProcessedEvents {
    async fn record_once(
        &self,
        source: WebhookSource,
        event_id: &str,
        event_name: &str,
        payload: &serde_json::Value,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (source, event_id, event_name, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source, event_id) DO NOTHING
            "#,
        )
        .bind(source.as_str())
        .bind(event_id)
        .bind(event_name)
        .bind(payload)
        .execute(&*self.pool)
        .await
        .map_err(|e| PipelineError::transient(format!("record processed event: {e}")))?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryProcessedEvents {
    seen: Arc<Mutex<HashSet<(WebhookSource, String)>>>,
}

impl InMemoryProcessedEvents {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEvents {
    async fn record_once(
        &self,
        source: WebhookSource,
        event_id: &str,
        _event_name: &str,
        _payload: &serde_json::Value,
    ) -> PipelineResult<bool> {
        Ok(self.seen.lock().await.insert((source, event_id.to_string())))
    }
}
