use std::time::Instant;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    middleware::Next,
    response::Response,
};

use karaoke_infra::blob::credentials::UPLOAD_TOKEN_HEADER;

use crate::app::errors;

/// Log one line per request with method, path, status and latency.
pub async fn log_requests(req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let res = next.run(req).await;

    let status = res.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    if res.status().is_server_error() {
        tracing::warn!(%method, %path, status, latency_ms, "request failed");
    } else {
        tracing::info!(%method, %path, status, latency_ms, "request");
    }
    res
}

/// Upload token taken from the `x-upload-token` header.
#[derive(Debug, Clone)]
pub struct UploadToken(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UploadToken {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(UPLOAD_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                errors::json_error(
                    StatusCode::UNAUTHORIZED,
                    "missing_credential",
                    format!("missing {UPLOAD_TOKEN_HEADER} header"),
                )
            })?;

        Ok(Self(token.to_string()))
    }
}
