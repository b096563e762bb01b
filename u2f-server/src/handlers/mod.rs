//! HTTP request handlers
//!
//! This module contains all the request handlers for the API endpoints.

pub mod authentication;
pub mod health;
pub mod registration;

pub use crate::state::AppState;
pub use authentication::{
    finish_authentication, start_authentication, FinishAuthenticationRequest,
    FinishAuthenticationResponse, StartAuthenticationRequest, StartAuthenticationResponse,
};
pub use health::{health, ready, HealthResponse, ReadyResponse};
pub use registration::{
    attach_device, finish_registration, start_registration, AttachDeviceRequest, DeviceSummary,
    FinishRegistrationRequest, FinishRegistrationResponse, StartRegistrationRequest,
    StartRegistrationResponse,
};
