use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/process", post(trigger_processing))
}

pub async fn create_job(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.controller.create_job().await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => errors::controller_error_to_response(e),
    }
}

pub async fn list_jobs(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.controller.list_jobs().await {
        Ok(listing) => Json(listing).into_response(),
        Err(e) => errors::controller_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.controller.get_job(job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::controller_error_to_response(e),
    }
}

pub async fn trigger_processing(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.controller.trigger_processing(job_id).await {
        Ok(triggered) => Json(triggered).into_response(),
        Err(e) => errors::controller_error_to_response(e),
    }
}
