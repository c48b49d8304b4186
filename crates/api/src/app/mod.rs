//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (stores, verifiers, sync runner)
//! - `handlers.rs`: per-source webhook handlers
//! - `routes/`: HTTP routes (ingestion, operator endpoints, health)
//! - `errors.rs`: consistent JSON error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

pub mod errors;
pub mod handlers;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/webhooks", routes::webhooks::router())
        .nest("/admin", routes::admin::router())
        .layer(Extension(services))
}
