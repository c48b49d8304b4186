//! Operator endpoints: failure-queue inspection and sync control.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use inflow_core::FailureId;
use inflow_sync::runner::SyncOutcome;
use inflow_sync::watermark::SyncType;
use inflow_webhooks::failure::FailureStatus;

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/failures", get(list_failures))
        .route("/failures/:id/retry", post(retry_failure))
        .route("/sync/:sync_type", get(sync_status))
        .route("/sync/:sync_type/run", post(trigger_sync))
}

#[derive(Debug, Deserialize)]
pub struct ListFailuresQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// GET /admin/failures?status=&limit= — inspect the failure queue.
pub async fn list_failures(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListFailuresQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match FailureStatus::from_str(raw) {
            Ok(s) => Some(s),
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e),
        },
    };
    let limit = query.limit.unwrap_or(50).min(500);

    let records = match services.failures.list_by_status(status, limit).await {
        Ok(records) => records,
        Err(e) => return errors::queue_error_to_response(e),
    };
    let stats = match services.failures.stats().await {
        Ok(stats) => stats,
        Err(e) => return errors::queue_error_to_response(e),
    };

    Json(json!({"failures": records, "stats": stats})).into_response()
}

/// POST /admin/failures/:id/retry — reset a dead letter for a fresh budget.
pub async fn retry_failure(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(id) = FailureId::from_str(&id) else {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "not a valid failure id");
    };

    match services.failures.retry_dead_letter(id).await {
        Ok(record) => {
            info!(failure_id = %id, "operator reset dead letter for retry");
            Json(record).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// GET /admin/sync/:sync_type — watermark and last-run diagnostics.
pub async fn sync_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(sync_type): Path<String>,
) -> axum::response::Response {
    match services.watermarks.get(&SyncType::new(sync_type.clone())).await {
        Ok(Some(watermark)) => Json(watermark).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_sync_type",
            format!("no watermark for sync type '{sync_type}'"),
        ),
        Err(e) => {
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

/// POST /admin/sync/:sync_type/run — trigger a run outside the schedule.
///
/// Runs inline; the watermark lock makes a trigger racing the periodic
/// worker harmless (one of them observes `AlreadyRunning`).
pub async fn trigger_sync(
    Extension(services): Extension<Arc<AppServices>>,
    Path(sync_type): Path<String>,
) -> axum::response::Response {
    if services.sync_runner.sync_type().as_str() != sync_type {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_sync_type",
            format!("no sync runner for type '{sync_type}'"),
        );
    }

    match services.sync_runner.run().await {
        Ok(SyncOutcome::Completed(report)) => Json(report).into_response(),
        Ok(SyncOutcome::AlreadyRunning) => errors::json_error(
            StatusCode::CONFLICT,
            "already_running",
            "a sync run for this type is already in flight",
        ),
        Err(e) => errors::json_error(StatusCode::BAD_GATEWAY, "sync_failed", e.to_string()),
    }
}
