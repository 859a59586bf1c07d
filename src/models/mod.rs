//! # Data Models
//!
//! Request and response bodies of the HTTP API.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::credentials::RequestFields;
use crate::oauth::CapturedFields;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "sf-auto-oauth".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Liveness probe response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    #[schema(example = "ok")]
    pub status: String,
}

/// Login request. Every field may be preset by the operator, in which case the
/// request value is ignored.
#[derive(Clone, Default, Deserialize, ToSchema, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct AuthRequest {
    #[schema(example = "admin@acme.com")]
    pub username: Option<String>,
    pub password: Option<String>,
    /// Login host, e.g. `https://login.salesforce.com` or `https://acme.my.salesforce.com`
    #[schema(example = "https://login.salesforce.com")]
    pub instance_url: Option<String>,
    /// Alias of `instanceUrl`
    pub domain: Option<String>,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("instance_url", &self.instance_url)
            .field("domain", &self.domain)
            .finish()
    }
}

impl From<AuthRequest> for RequestFields {
    fn from(request: AuthRequest) -> Self {
        Self {
            username: request.username,
            password: request.password,
            instance_url: request.instance_url,
            domain: request.domain,
        }
    }
}

/// Captured org authorization
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[schema(example = "00D5g000004EabcEAC")]
    pub org_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// `force://` URL accepted by `sf org login sfdx-url`
    #[schema(example = "force://PlatformCLI::5Aep861...@acme.my.salesforce.com")]
    pub sfdx_auth_url: String,
}

impl From<CapturedFields> for AuthPayload {
    fn from(fields: CapturedFields) -> Self {
        Self {
            org_id: fields.org_id,
            access_token: fields.access_token.to_string(),
            refresh_token: fields.refresh_token.to_string(),
            sfdx_auth_url: fields.encoded_auth_url.to_string(),
        }
    }
}

/// Successful login response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    /// Always `true`
    pub success: bool,
    pub auth: AuthPayload,
}

impl AuthResponse {
    pub fn new(auth: AuthPayload) -> Self {
        Self {
            success: true,
            auth,
        }
    }
}
