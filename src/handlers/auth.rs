//! Login endpoints.
//!
//! `/auth` and `/sfdxauthurl` share one contract; both accept a JSON body (POST) or a
//! query string (GET).

use axum::{
    Json,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
};
use tracing::info;

use crate::credentials::{self, RequestFields};
use crate::error::{ApiError, ErrorBody};
use crate::models::{AuthRequest, AuthResponse};
use crate::server::AppState;

/// Validates the request, runs one login flow and maps the outcome.
async fn authenticate(state: &AppState, request: AuthRequest) -> Result<Json<AuthResponse>, ApiError> {
    let fields = RequestFields::from(request);
    let credentials = credentials::validate(
        &state.config.credentials,
        &fields,
        &state.domain_policy,
    )?;

    info!(login_url = %credentials.login_url(), "starting login flow");
    let captured = state.flow.run(&credentials).await?;
    Ok(Json(AuthResponse::new(captured.into())))
}

/// A POST without a JSON content type is treated as an empty request, so operators
/// who preset every credential can call the endpoint without a body.
fn body_or_default(payload: Result<Json<AuthRequest>, JsonRejection>) -> Result<AuthRequest, ApiError> {
    match payload {
        Ok(Json(request)) => Ok(request),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(AuthRequest::default()),
        Err(rejection) => Err(rejection.into()),
    }
}

/// Log in with a JSON body and capture an org authorization
#[utoipa::path(
    post,
    path = "/auth",
    request_body = AuthRequest,
    responses(
        (status = 200, description = "Org authorized", body = AuthResponse),
        (status = 400, description = "Missing field or invalid instance URL", body = ErrorBody),
        (status = 401, description = "Login rejected by the identity provider", body = ErrorBody),
        (status = 500, description = "Browser automation or token capture failed", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn post_auth(
    State(state): State<AppState>,
    payload: Result<Json<AuthRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    authenticate(&state, body_or_default(payload)?).await
}

/// Log in with query parameters and capture an org authorization
#[utoipa::path(
    get,
    path = "/auth",
    params(AuthRequest),
    responses(
        (status = 200, description = "Org authorized", body = AuthResponse),
        (status = 400, description = "Missing field or invalid instance URL", body = ErrorBody),
        (status = 401, description = "Login rejected by the identity provider", body = ErrorBody),
        (status = 500, description = "Browser automation or token capture failed", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn get_auth(
    State(state): State<AppState>,
    query: Result<Query<AuthRequest>, QueryRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let Query(request) = query?;
    authenticate(&state, request).await
}

/// Same as `POST /auth`
#[utoipa::path(
    post,
    path = "/sfdxauthurl",
    request_body = AuthRequest,
    responses(
        (status = 200, description = "Org authorized", body = AuthResponse),
        (status = 400, description = "Missing field or invalid instance URL", body = ErrorBody),
        (status = 401, description = "Login rejected by the identity provider", body = ErrorBody),
        (status = 500, description = "Browser automation or token capture failed", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn post_sfdx_auth_url(
    State(state): State<AppState>,
    payload: Result<Json<AuthRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    authenticate(&state, body_or_default(payload)?).await
}

/// Same as `GET /auth`
#[utoipa::path(
    get,
    path = "/sfdxauthurl",
    params(AuthRequest),
    responses(
        (status = 200, description = "Org authorized", body = AuthResponse),
        (status = 400, description = "Missing field or invalid instance URL", body = ErrorBody),
        (status = 401, description = "Login rejected by the identity provider", body = ErrorBody),
        (status = 500, description = "Browser automation or token capture failed", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn get_sfdx_auth_url(
    State(state): State<AppState>,
    query: Result<Query<AuthRequest>, QueryRejection>,
) -> Result<Json<AuthResponse>, ApiError> {
    let Query(request) = query?;
    authenticate(&state, request).await
}
