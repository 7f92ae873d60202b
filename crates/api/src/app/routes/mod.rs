use axum::{Router, routing::get};

pub mod blobs;
pub mod jobs;
pub mod system;
pub mod uploads;

/// Router for every endpoint except health.
pub fn router(max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(system::info))
        .nest("/jobs", jobs::router())
        .nest("/uploads", uploads::router(max_upload_bytes))
        .nest("/blobs", blobs::router())
}
