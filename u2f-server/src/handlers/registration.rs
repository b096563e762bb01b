//! Registration ceremony handlers
//!
//! - POST /u2f/registration/start - Issue an enrollment challenge
//! - POST /u2f/registration/finish - Verify attestation and enroll the device
//! - POST /u2f/registration/attach - Bind a one-step enrollment to a user

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use u2f_core::{DeviceRegistration, RegisterRequestMessage, RegisterResponse, StartRegistration};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

/// Maximum length of a user-supplied device name
const MAX_DISPLAY_NAME_LEN: usize = 64;

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartRegistrationRequest {
    /// Omitted for one-step enrollment
    pub username: Option<String>,
    pub session_id: Option<String>,
    pub application: Option<String>,
}

/// Challenge to pass to `u2f.register`
#[derive(Debug, Serialize, ToSchema)]
pub struct StartRegistrationResponse {
    pub request_id: String,
    /// `{ "registerRequests": [...], "authenticateRequests": [...] }`
    #[schema(value_type = Object)]
    pub message: RegisterRequestMessage,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FinishRegistrationRequest {
    pub username: Option<String>,
    /// Friendly name shown in device lists
    pub display_name: Option<String>,
    /// `{ "registrationData", "clientData" }` from `u2f.register`
    #[schema(value_type = Object)]
    pub response: RegisterResponse,
}

/// Public view of an enrolled device
#[derive(Debug, Serialize, ToSchema)]
pub struct DeviceSummary {
    pub id: String,
    pub user_id: Option<String>,
    pub application: String,
    pub key_handle: String,
    pub display_name: Option<String>,
    pub status: String,
    /// Absent until the first authentication
    pub counter: Option<u32>,
    pub creation_date: DateTime<Utc>,
    /// Set while the enrollment is provisional
    pub expiration_date: Option<DateTime<Utc>>,
}

impl From<DeviceRegistration> for DeviceSummary {
    fn from(device: DeviceRegistration) -> Self {
        Self {
            id: device.id,
            user_id: device.user_id,
            application: device.application,
            key_handle: device.key_handle,
            display_name: device.display_name,
            status: device.status.to_string(),
            counter: device.counter,
            creation_date: device.creation_date,
            expiration_date: device.expiration_date,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FinishRegistrationResponse {
    pub request_id: String,
    /// Always "success"; failures are returned as errors
    pub result: &'static str,
    pub one_step: bool,
    pub device: DeviceSummary,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AttachDeviceRequest {
    pub username: String,
    pub device_id: String,
}

/// POST /u2f/registration/start
///
/// Start enrolling a new device. Devices the user already owns are listed
/// so the token can refuse to register twice.
#[utoipa::path(
    post,
    path = "/u2f/registration/start",
    tag = "Registration",
    request_body = StartRegistrationRequest,
    responses(
        (status = 200, description = "Enrollment challenge issued", body = StartRegistrationResponse),
        (status = 400, description = "Unknown user or invalid session")
    )
)]
pub async fn start_registration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRegistrationRequest>,
) -> Result<Json<StartRegistrationResponse>, ApiError> {
    let input = StartRegistration {
        username: req.username,
        application: req.application,
        session_id: req.session_id,
    };

    let message = state.engine.registration.start(input).await?;
    let request_id = message
        .request_id()
        .map(str::to_string)
        .ok_or_else(|| ApiError::internal("Registration request without challenges"))?;

    Ok(Json(StartRegistrationResponse {
        request_id,
        message,
    }))
}

/// POST /u2f/registration/finish
///
/// Verify the attestation signature and enroll the device. One-step
/// enrollments stay provisional until attached to a user.
#[utoipa::path(
    post,
    path = "/u2f/registration/finish",
    tag = "Registration",
    request_body = FinishRegistrationRequest,
    responses(
        (status = 200, description = "Device enrolled", body = FinishRegistrationResponse),
        (status = 400, description = "Invalid registration data, or request expired or already used")
    )
)]
pub async fn finish_registration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FinishRegistrationRequest>,
) -> Result<Json<FinishRegistrationResponse>, ApiError> {
    let display_name = req
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    if display_name
        .as_ref()
        .is_some_and(|name| name.chars().count() > MAX_DISPLAY_NAME_LEN)
    {
        return Err(ApiError::bad_request(format!(
            "display_name must be at most {} characters",
            MAX_DISPLAY_NAME_LEN
        )));
    }

    let outcome = state
        .engine
        .registration
        .finish(req.username.as_deref(), &req.response, display_name)
        .await?;

    Ok(Json(FinishRegistrationResponse {
        request_id: outcome.request_id,
        result: "success",
        one_step: outcome.one_step,
        device: outcome.device.into(),
    }))
}

/// POST /u2f/registration/attach
///
/// Bind a provisional one-step enrollment to a user and make it permanent.
#[utoipa::path(
    post,
    path = "/u2f/registration/attach",
    tag = "Registration",
    request_body = AttachDeviceRequest,
    responses(
        (status = 200, description = "Device attached", body = DeviceSummary),
        (status = 400, description = "Unknown user or device, or device already owned")
    )
)]
pub async fn attach_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AttachDeviceRequest>,
) -> Result<Json<DeviceSummary>, ApiError> {
    let device = state
        .engine
        .registration
        .attach(&req.username, &req.device_id)
        .await?;

    tracing::info!(device_id = %device.id, "Device attached to user");
    Ok(Json(device.into()))
}
