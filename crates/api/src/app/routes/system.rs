use axum::{Json, http::StatusCode};

use crate::app::dto::ServiceInfo;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn info() -> Json<ServiceInfo> {
    Json(ServiceInfo::current())
}
