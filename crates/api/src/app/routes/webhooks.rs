//! Webhook ingestion.
//!
//! A 2xx response is a durability promise to the provider: the event was
//! either processed inline or enqueued for retry. An unverified event gets
//! 401 and leaves no trace beyond a warn log — nothing unauthenticated is
//! ever persisted.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use inflow_core::PipelineError;
use inflow_webhooks::event::{WebhookEvent, WebhookSource};
use inflow_webhooks::failure::{AttemptOutcome, WebhookFailureRecord};
use inflow_webhooks::retry::RetryPolicy;
use inflow_webhooks::signature::SignatureVerifier;

use crate::app::{errors, services::AppServices};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

pub fn router() -> Router {
    Router::new().route("/:provider", post(receive))
}

pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let Ok(source) = provider.parse::<WebhookSource>() else {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_provider",
            format!("no webhook endpoint for provider '{provider}'"),
        );
    };

    let signature = header_str(&headers, SIGNATURE_HEADER);
    let timestamp = header_str(&headers, TIMESTAMP_HEADER);
    let captured: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    ingest_webhook(&services, source, signature, timestamp, &body, captured).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Verify, process inline, and fall back to the failure queue.
///
/// Split from the Axum extractor layer so the full decision tree is
/// testable without a socket.
pub async fn ingest_webhook(
    services: &AppServices,
    source: WebhookSource,
    signature: Option<&str>,
    timestamp: Option<&str>,
    body: &[u8],
    captured_headers: Vec<(String, String)>,
) -> axum::response::Response {
    let now = Utc::now();
    let Some(verifier) = services.verifiers.get(&source) else {
        return errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unconfigured_provider",
            format!("no signing secret configured for {source}"),
        );
    };

    if let Err(e) = verifier.verify(body, signature, timestamp, now) {
        warn!(
            source = source.as_str(),
            error = %e,
            timestamp_age_secs = SignatureVerifier::timestamp_age(timestamp, now),
            "webhook rejected, dropping"
        );
        return errors::json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "signature verification failed",
        );
    }

    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(source = source.as_str(), error = %e, "verified webhook body is not JSON");
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_payload",
                "request body must be a JSON document",
            );
        }
    };

    let event_name = payload
        .get("event")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let event = WebhookEvent::new(source, event_name.clone(), payload.clone());

    let inline_result = match services.registry.get(source) {
        Some(handler) => handler.handle(&event).await,
        None => Err(PipelineError::permanent(format!(
            "no handler registered for source {source}"
        ))),
    };

    match inline_result {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "processed"})),
        )
            .into_response(),
        Err(e) if e.is_transient() => {
            let record = WebhookFailureRecord::new(
                source,
                event_name.clone(),
                payload,
                captured_headers,
                signature.map(str::to_string),
            )
            .with_max_attempts(services.retry_max_attempts);

            match services.failures.enqueue(record).await {
                Ok(id) => {
                    info!(
                        source = source.as_str(),
                        event_name = %event_name,
                        failure_id = %id,
                        error = %e,
                        "inline processing failed transiently, queued for retry"
                    );
                    (
                        StatusCode::OK,
                        Json(json!({"status": "queued", "failure_id": id})),
                    )
                        .into_response()
                }
                // Could not persist: the durability promise cannot be made,
                // so the provider must redeliver.
                Err(store_err) => {
                    warn!(
                        source = source.as_str(),
                        error = %store_err,
                        "failed to enqueue webhook failure"
                    );
                    errors::json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "enqueue_failed",
                        "event could not be accepted durably",
                    )
                }
            }
        }
        Err(e) => {
            // Permanent: record it straight into dead letter for audit.
            let mut record = WebhookFailureRecord::new(
                source,
                event_name.clone(),
                payload,
                captured_headers,
                signature.map(str::to_string),
            );
            record.begin_attempt(now);
            record.resolve(
                AttemptOutcome::Permanent(e.to_string()),
                &RetryPolicy::default(),
                now,
            );

            warn!(
                source = source.as_str(),
                event_name = %event_name,
                error = %e,
                "inline processing failed permanently, dead-lettering"
            );
            match services.failures.enqueue(record).await {
                Ok(id) => (
                    StatusCode::OK,
                    Json(json!({"status": "dead_lettered", "failure_id": id})),
                )
                    .into_response(),
                Err(store_err) => {
                    warn!(source = source.as_str(), error = %store_err, "failed to record dead letter");
                    errors::json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "enqueue_failed",
                        "event could not be accepted durably",
                    )
                }
            }
        }
    }
}
