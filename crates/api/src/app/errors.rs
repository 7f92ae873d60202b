use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use karaoke_infra::blob::{BlobError, CredentialError};
use karaoke_infra::jobs::{ControllerError, JobStoreError};

pub fn controller_error_to_response(err: ControllerError) -> axum::response::Response {
    match err {
        ControllerError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        ControllerError::InvalidState { .. } => json_error(
            StatusCode::BAD_REQUEST,
            "invalid_state",
            "Job is in a wrong state",
        ),
        ControllerError::InvalidLocation(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_location", msg),
        ControllerError::Credential(CredentialError::Expired) => json_error(
            StatusCode::UNAUTHORIZED,
            "credential_expired",
            "upload credential expired",
        ),
        ControllerError::Credential(CredentialError::Invalid(msg)) => {
            json_error(StatusCode::UNAUTHORIZED, "invalid_credential", msg)
        }
        ControllerError::Credential(e @ CredentialError::Signing(_)) => {
            tracing::error!(error = %e, "credential signing failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "signing_error", e.to_string())
        }
        ControllerError::ScopeMismatch(location) => json_error(
            StatusCode::FORBIDDEN,
            "scope_mismatch",
            format!("credential does not cover {location}"),
        ),
        ControllerError::AlreadyUploaded(location) => json_error(
            StatusCode::CONFLICT,
            "already_uploaded",
            format!("{location} has already been uploaded"),
        ),
        ControllerError::Store(e) => store_error_to_response(e),
        ControllerError::Queue(e) => {
            tracing::warn!(error = %e, "work queue unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string())
        }
        ControllerError::Blob(BlobError::NotFound(location)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("{location} not found"))
        }
        ControllerError::Blob(e) => {
            tracing::warn!(error = %e, "blob store error");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "blob_store_unavailable", e.to_string())
        }
    }
}

/// Upload-specific mapping: a job that is past `uploading` is a conflict.
pub fn upload_error_to_response(err: ControllerError) -> axum::response::Response {
    match err {
        ControllerError::InvalidState { job_id, status } => json_error(
            StatusCode::CONFLICT,
            "invalid_state",
            format!("job {job_id} is {status}; uploads are closed"),
        ),
        other => controller_error_to_response(other),
    }
}

fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    if err.is_transient() {
        tracing::warn!(error = %err, "job store unavailable");
        json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
    } else {
        tracing::error!(error = %err, "job store error");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
    }
}

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
