//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: controller wiring shared by every route
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: response DTOs and parsing helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: AppServices) -> Router {
    let max_upload_bytes = services.max_upload_bytes;
    let services = Arc::new(services);

    let api = routes::router(max_upload_bytes).layer(Extension(services));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(api)
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(middleware::log_requests)))
}
