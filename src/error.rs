//! # Error Handling
//!
//! Unified error responses for the API. Every failure is rendered as
//! `{"success": false, "error": "...", "code": "...", "traceId": "..."}` with the
//! status code chosen by the error's origin.

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::browser::BrowserError;
use crate::credentials::ValidationError;
use crate::flow::FlowError;
use crate::telemetry;

pub const REJECTED_CREDENTIALS_MESSAGE: &str = "Please check your username and password.";

/// Unified API error.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Correlation trace ID for debugging
    pub trace_id: Option<Box<str>>,
}

/// Wire shape of an error response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Always `false`
    pub success: bool,
    /// Human-readable error message
    #[schema(example = "Missing username.")]
    pub error: String,
    /// Machine-readable error code
    #[schema(example = "MISSING_FIELD")]
    pub code: String,
    /// Correlation id, echoed in the `x-request-id` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn bad_request(code: &str, message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn internal(code: &str, message: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    /// Current trace ID of the request (falls back to a generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            success: false,
            error: self.message.to_string(),
            code: self.code.to_string(),
            trace_id: self.trace_id.as_deref().map(str::to_string),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        (self.status, headers, Json(self.body())).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        let code = match error {
            ValidationError::InvalidDomain { .. } => "INVALID_DOMAIN",
            ValidationError::Missing(_) | ValidationError::Empty(_) => "MISSING_FIELD",
        };
        Self::bad_request(code, &error.to_string())
    }
}

impl From<FlowError> for ApiError {
    fn from(error: FlowError) -> Self {
        match error {
            FlowError::CredentialRejected => Self::new(
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_REJECTED",
                REJECTED_CREDENTIALS_MESSAGE,
            ),
            FlowError::Acquisition(source) => {
                tracing::error!(error = %source, "browser session could not be started");
                Self::internal(
                    "ACQUISITION_FAILED",
                    "Failed to start browser automation session.",
                )
            }
            FlowError::Automation(source) => match source {
                BrowserError::ElementNotFound { .. } | BrowserError::Navigation { .. } => {
                    Self::internal("AUTOMATION_FAILED", &source.to_string())
                }
                other => {
                    tracing::error!(error = %other, "browser automation failed");
                    Self::internal("AUTOMATION_FAILED", "Browser automation failed.")
                }
            },
            FlowError::Capture(source) => {
                tracing::error!(error = %source, "OAuth capture failed");
                Self::internal("CAPTURE_FAILED", "Failed to capture OAuth tokens.")
            }
            FlowError::DeadlineExceeded(timeout) => {
                tracing::error!(?timeout, "login flow deadline exceeded");
                Self::internal("DEADLINE_EXCEEDED", "Login flow timed out.")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err.body_text()),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err.body_text()),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };
        Self::bad_request("INVALID_REQUEST", &message)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(
            "INVALID_REQUEST",
            &format!("Invalid query string: {}", rejection.body_text()),
        )
    }
}
