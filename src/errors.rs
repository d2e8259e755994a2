use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing or malformed bearer credential")]
    MissingCredential,

    #[error("copilot token issuance failed: {0}")]
    IssuanceFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown or expired device code")]
    UnknownDeviceCode,

    #[error("device authorization denied: {0}")]
    DeviceFlowDenied(String),

    #[error("device authorization timed out")]
    DeviceFlowTimeout,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Failure to exchange a caller's credential for an artifact. Always
    /// unauthorized, whatever the collaborator's reason.
    pub fn from_issuance(err: AuthError) -> Self {
        AppError::IssuanceFailed(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Denied(reason) => AppError::DeviceFlowDenied(reason),
            AuthError::Expired => AppError::DeviceFlowTimeout,
            other => AppError::Upstream(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::MissingCredential => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "missing_credential",
                "missing or malformed bearer credential".to_string(),
            ),
            AppError::IssuanceFailed(e) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "issuance_failed",
                format!("could not obtain a copilot token: {}", e),
            ),
            AppError::BadRequest(e) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                e.clone(),
            ),
            AppError::UnknownDeviceCode => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "unknown_device_code",
                "device code was not issued by this gateway or has expired".to_string(),
            ),
            AppError::DeviceFlowDenied(reason) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "device_flow_denied",
                reason.clone(),
            ),
            AppError::DeviceFlowTimeout => (
                StatusCode::REQUEST_TIMEOUT,
                "timeout_error",
                "device_flow_timeout",
                "timed out waiting for device authorization".to_string(),
            ),
            AppError::Upstream(e) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "upstream_failed",
                e.clone(),
            ),
            AppError::UpstreamTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                "upstream_timeout",
                "upstream did not respond in time".to_string(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
