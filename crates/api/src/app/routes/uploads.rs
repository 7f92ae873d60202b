use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::put,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::middleware::UploadToken;

pub fn router(max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/:bucket/*key", put(upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

/// Direct upload authorised by the credential issued at job creation.
pub async fn upload(
    Extension(services): Extension<Arc<AppServices>>,
    Path((bucket, key)): Path<(String, String)>,
    UploadToken(token): UploadToken,
    body: Bytes,
) -> axum::response::Response {
    match services
        .controller
        .upload_input(&bucket, &key, &token, body.to_vec())
        .await
    {
        Ok(location) => (
            StatusCode::CREATED,
            Json(dto::UploadReceipt {
                location: location.to_string(),
            }),
        )
            .into_response(),
        Err(e) => errors::upload_error_to_response(e),
    }
}
