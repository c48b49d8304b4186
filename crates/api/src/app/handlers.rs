//! Webhook handlers registered per source.
//!
//! The same handler instance serves inline processing at the HTTP boundary
//! and redelivery from the retry scheduler, so idempotency lives here: each
//! event's `(source, id)` pair is claimed in the processed-events ledger
//! before any side effect, and duplicates are absorbed silently.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use inflow_core::{PipelineError, PipelineResult};
use inflow_infra::ProcessedEventStore;
use inflow_webhooks::event::{EventKind, WebhookEvent};
use inflow_webhooks::handler::WebhookHandler;

/// Stable identity of an event, for deduplication.
///
/// Providers put the delivery id in a top-level `id` field; payloads that
/// lack one fall back to the domain identity of the typed projection. An
/// event with no extractable identity cannot be made idempotent and is
/// rejected permanently.
pub fn event_id(event: &WebhookEvent) -> Option<String> {
    if let Some(id) = event.payload.get("id").and_then(|v| v.as_str()) {
        return Some(id.to_string());
    }
    match event.classify() {
        EventKind::CheckoutCompleted(p) => Some(p.session_id),
        EventKind::EmailStatus(p) => Some(p.message_id),
        EventKind::CrmRecordChanged(p) => Some(p.record_id),
        EventKind::Unrecognized => None,
    }
}

/// Handler that records processed events and logs the typed projection.
///
/// Downstream business effects (fulfilment, suppression lists, cache
/// invalidation) hang off the processed-events ledger; the pipeline itself
/// only guarantees each verified event is durably recorded exactly once.
pub struct RecordingWebhookHandler {
    processed: Arc<dyn ProcessedEventStore>,
}

impl RecordingWebhookHandler {
    pub fn new(processed: Arc<dyn ProcessedEventStore>) -> Self {
        Self { processed }
    }
}

#[async_trait]
impl WebhookHandler for RecordingWebhookHandler {
    async fn handle(&self, event: &WebhookEvent) -> PipelineResult<()> {
        let Some(id) = event_id(event) else {
            return Err(PipelineError::permanent(format!(
                "event {}/{} carries no usable id",
                event.source, event.event_name
            )));
        };

        let fresh = self
            .processed
            .record_once(event.source, &id, &event.event_name, &event.payload)
            .await?;
        if !fresh {
            debug!(
                source = event.source.as_str(),
                event_id = %id,
                "duplicate delivery absorbed"
            );
            return Ok(());
        }

        match event.classify() {
            EventKind::CheckoutCompleted(p) => info!(
                event_id = %id,
                session_id = %p.session_id,
                amount_cents = p.amount_cents,
                "checkout completed"
            ),
            EventKind::EmailStatus(p) => info!(
                event_id = %id,
                message_id = %p.message_id,
                recipient = %p.recipient,
                reason = p.reason.as_deref().unwrap_or(""),
                event_name = %event.event_name,
                "email status update"
            ),
            EventKind::CrmRecordChanged(p) => info!(
                event_id = %id,
                record_id = %p.record_id,
                "crm record changed upstream"
            ),
            EventKind::Unrecognized => info!(
                source = event.source.as_str(),
                event_id = %id,
                event_name = %event.event_name,
                "unrecognized event recorded"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use inflow_infra::InMemoryProcessedEvents;
    use inflow_webhooks::event::WebhookSource;

    #[tokio::test]
    async fn duplicate_deliveries_are_absorbed() {
        let handler =
            RecordingWebhookHandler::new(Arc::new(InMemoryProcessedEvents::new()));
        let event = WebhookEvent::new(
            WebhookSource::Payments,
            "checkout.completed",
            json!({"id": "evt_1", "session_id": "cs_1", "amount_cents": 500}),
        );

        assert!(handler.handle(&event).await.is_ok());
        assert!(handler.handle(&event).await.is_ok());
    }

    #[tokio::test]
    async fn event_without_identity_is_permanent() {
        let handler =
            RecordingWebhookHandler::new(Arc::new(InMemoryProcessedEvents::new()));
        let event = WebhookEvent::new(WebhookSource::Payments, "weird.event", json!({}));

        let err = handler.handle(&event).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn identity_falls_back_to_domain_ids() {
        let event = WebhookEvent::new(
            WebhookSource::Email,
            "message.bounced",
            json!({"message_id": "m-7", "recipient": "a@b.c"}),
        );
        assert_eq!(event_id(&event).as_deref(), Some("m-7"));

        let event = WebhookEvent::new(
            WebhookSource::Crm,
            "record.changed",
            json!({"id": "evt_9", "record_id": "J-3"}),
        );
        // Top-level id wins over the projection's id.
        assert_eq!(event_id(&event).as_deref(), Some("evt_9"));
    }
}
