//! # API Handlers
//!
//! HTTP endpoint handlers for the login automation API.

pub mod auth;

use crate::models::{HealthStatus, ServiceInfo};
use axum::response::Json;

pub use auth::{get_auth, get_sfdx_auth_url, post_auth, post_sfdx_auth_url};

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is running", body = HealthStatus)
    ),
    tag = "root"
)]
pub async fn healthz() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
    })
}
