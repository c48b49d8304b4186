use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use inflow_webhooks::store::FailureQueueError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn queue_error_to_response(err: FailureQueueError) -> axum::response::Response {
    match err {
        FailureQueueError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("failure record {id} not found"),
        ),
        FailureQueueError::NotDeadLettered(id) => json_error(
            StatusCode::CONFLICT,
            "not_dead_lettered",
            format!("record {id} is not in dead_letter state"),
        ),
        FailureQueueError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}
