use std::sync::Arc;

use axum::{
    Router,
    extract::{Extension, Path},
    http::header,
    response::IntoResponse,
    routing::get,
};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:bucket/*key", get(download))
}

/// Serve a produced output file.
pub async fn download(
    Extension(services): Extension<Arc<AppServices>>,
    Path((bucket, key)): Path<(String, String)>,
) -> axum::response::Response {
    match services.controller.read_output(&bucket, &key).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type(&key))], bytes).into_response(),
        Err(e) => errors::controller_error_to_response(e),
    }
}

fn content_type(key: &str) -> &'static str {
    match key.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        Some("wma") => "audio/x-ms-wma",
        _ => "application/octet-stream",
    }
}
