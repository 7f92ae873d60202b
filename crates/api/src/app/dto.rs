//! Request/response DTOs and parsing helpers.

use axum::http::StatusCode;
use serde::Serialize;

use karaoke_core::JobId;

use crate::app::errors;

#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl ServiceInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadReceipt {
    pub location: String,
}

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse().map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("not a valid job id: {raw}"),
        )
    })
}
