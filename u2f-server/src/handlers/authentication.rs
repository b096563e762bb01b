//! Authentication ceremony handlers
//!
//! - POST /u2f/authentication/start - Issue one challenge per eligible device
//! - POST /u2f/authentication/finish - Verify the signed response

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use u2f_core::{AuthenticateRequestMessage, AuthenticateResponse, StartAuthentication};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

/// Request to start authentication.
///
/// Two-step: `username` and `session_id`. One-step: `key_handle`, with
/// `application` defaulting to the configured app id.
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartAuthenticationRequest {
    pub username: Option<String>,
    pub session_id: Option<String>,
    pub key_handle: Option<String>,
    pub application: Option<String>,
}

/// Challenges to pass to `u2f.sign`
#[derive(Debug, Serialize, ToSchema)]
pub struct StartAuthenticationResponse {
    /// Identifier of the ceremony (the first challenge)
    pub request_id: String,
    /// `{ "authenticateRequests": [...] }`
    #[schema(value_type = Object)]
    pub message: AuthenticateRequestMessage,
}

/// Device response to a pending authentication
#[derive(Debug, Deserialize, ToSchema)]
pub struct FinishAuthenticationRequest {
    /// Omitted for one-step authentication
    pub username: Option<String>,
    /// `{ "clientData", "signatureData", "keyHandle" }` from `u2f.sign`
    #[schema(value_type = Object)]
    pub response: AuthenticateResponse,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FinishAuthenticationResponse {
    pub request_id: String,
    /// Always "success"; failures are returned as errors
    pub result: &'static str,
    pub user_id: String,
    pub device_id: String,
    /// Counter reported by this assertion
    pub counter: Option<u32>,
    pub one_step: bool,
}

/// POST /u2f/authentication/start
///
/// Start an authentication ceremony. Every active device of the user receives
/// its own challenge; any one of them may answer.
#[utoipa::path(
    post,
    path = "/u2f/authentication/start",
    tag = "Authentication",
    request_body = StartAuthenticationRequest,
    responses(
        (status = 200, description = "Challenges issued", body = StartAuthenticationResponse),
        (status = 400, description = "Unknown user, key handle or invalid session"),
        (status = 404, description = "User has no eligible devices")
    )
)]
pub async fn start_authentication(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartAuthenticationRequest>,
) -> Result<Json<StartAuthenticationResponse>, ApiError> {
    let input = StartAuthentication {
        username: req.username,
        key_handle: req.key_handle,
        application: req.application,
        session_id: req.session_id,
    };

    let message = state.engine.authentication.start(input).await?;
    let request_id = message
        .request_id()
        .map(str::to_string)
        .ok_or_else(|| ApiError::internal("Authentication request without challenges"))?;

    Ok(Json(StartAuthenticationResponse {
        request_id,
        message,
    }))
}

/// POST /u2f/authentication/finish
///
/// Verify a signed response. A request can be finished only once; a
/// non-increasing counter disables the device.
#[utoipa::path(
    post,
    path = "/u2f/authentication/finish",
    tag = "Authentication",
    request_body = FinishAuthenticationRequest,
    responses(
        (status = 200, description = "Authentication succeeded", body = FinishAuthenticationResponse),
        (status = 400, description = "Invalid response, or request expired or already used"),
        (status = 403, description = "Device compromised and disabled")
    )
)]
pub async fn finish_authentication(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FinishAuthenticationRequest>,
) -> Result<Json<FinishAuthenticationResponse>, ApiError> {
    let outcome = state
        .engine
        .authentication
        .finish(req.username.as_deref(), &req.response)
        .await?;

    Ok(Json(FinishAuthenticationResponse {
        request_id: outcome.request_id,
        result: "success",
        user_id: outcome.user_id,
        device_id: outcome.device.id,
        counter: outcome.device.counter,
        one_step: outcome.one_step,
    }))
}
