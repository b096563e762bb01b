//! API error handling module
//!
//! Provides a unified error type for all API endpoints with structured error variants.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use u2f_core::U2fError;

/// API error type with structured variants for different error categories
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request - client provided invalid input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error - unexpected server-side failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Error from the U2F engine
    #[error("U2F error: {0}")]
    U2f(#[from] U2fError),
}

impl ApiError {
    /// Create a bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Create an internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::U2f(ref e) => match e {
                // Protocol errors → 400; the client restarts the ceremony
                U2fError::BadInput(_) | U2fError::SessionExpired { .. } => StatusCode::BAD_REQUEST,

                U2fError::NoEligibleDevices(_) => StatusCode::NOT_FOUND,

                // Security incident → 403
                U2fError::DeviceCompromised(_) => StatusCode::FORBIDDEN,

                // Internal processing failures → 500
                U2fError::DuplicateRequestId(_)
                | U2fError::Storage(_)
                | U2fError::Crypto(_)
                | U2fError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Get the error code for programmatic error handling
    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "INVALID_INPUT",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::U2f(ref e) => match e {
                U2fError::BadInput(_) => "BAD_INPUT",
                U2fError::SessionExpired { .. } => "SESSION_EXPIRED",
                U2fError::NoEligibleDevices(_) => "NO_ELIGIBLE_DEVICES",
                U2fError::DeviceCompromised(_) => "DEVICE_COMPROMISED",
                U2fError::DuplicateRequestId(_) => "DUPLICATE_REQUEST_ID",
                U2fError::Storage(_) => "STORAGE_ERROR",
                U2fError::Crypto(_) => "CRYPTO_ERROR",
                U2fError::ServerError(_) => "INTERNAL_ERROR",
            },
        }
    }

    /// Get sanitized error message for client response
    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            Self::U2f(ref e) => match e {
                U2fError::BadInput(msg) => msg.clone(),
                U2fError::SessionExpired { .. } => {
                    "Request not found or already used; start again".to_string()
                }
                U2fError::NoEligibleDevices(_) => "No eligible U2F devices".to_string(),
                U2fError::DeviceCompromised(_) => {
                    "Device has been disabled after a security check failed".to_string()
                }
                U2fError::DuplicateRequestId(_)
                | U2fError::Storage(_)
                | U2fError::Crypto(_)
                | U2fError::ServerError(_) => "Internal server error".to_string(),
            },
            // For other errors, use the Display message
            _ => self.to_string(),
        }
    }

    /// Get the error category for logging
    fn error_category(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal",
            Self::U2f(_) => "u2f",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let category = self.error_category();
        let code = self.error_code();
        let internal_message = self.to_string();
        let client_message = self.client_message();

        // Log based on severity, always including internal details
        if status.is_server_error() {
            tracing::error!(
                status = %status,
                category = category,
                code = code,
                error = %internal_message,
                "Server error"
            );
        } else if status == StatusCode::FORBIDDEN {
            tracing::warn!(
                status = %status,
                category = category,
                code = code,
                error = %internal_message,
                "Security rejection"
            );
        } else {
            tracing::warn!(
                status = %status,
                category = category,
                code = code,
                error = %internal_message,
                "Client error"
            );
        }

        // All error responses include a `code` field for programmatic error handling
        let body = serde_json::json!({
            "error": client_message,
            "code": code,
        });

        (status, Json(body)).into_response()
    }
}
