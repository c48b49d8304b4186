//! Handler seam between ingestion and the retry scheduler.
//!
//! Inline processing at the HTTP boundary and redelivery from the failure
//! queue must run the *same* handler logic, so both dispatch through this
//! registry. Handlers must be idempotent: a crash between "attempt
//! succeeds" and "status persisted" can cause a duplicate delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use inflow_core::PipelineResult;

use crate::event::{WebhookEvent, WebhookSource};

/// Processes a verified webhook event.
///
/// Implementations classify errors via `PipelineError`: `Transient` sends
/// the event to the failure queue (inline) or reschedules it (redelivery);
/// `Permanent` dead-letters it.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> PipelineResult<()>;
}

/// Per-source handler registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<WebhookSource, Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: WebhookSource, handler: Arc<dyn WebhookHandler>) {
        self.handlers.insert(source, handler);
    }

    pub fn get(&self, source: WebhookSource) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers.get(&source).cloned()
    }

    pub fn sources(&self) -> impl Iterator<Item = WebhookSource> + '_ {
        self.handlers.keys().copied()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("sources", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
