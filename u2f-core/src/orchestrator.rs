//! Authentication ceremonies.
//!
//! Two workflows share one pipeline:
//!
//! - **Two-step**: the caller knows the username and holds a browser
//!   session. Every active device of the user is challenged.
//! - **One-step**: the caller only presents a key handle. Its owner is
//!   resolved from the device directory and then treated like two-step,
//!   without a session.

use std::sync::Arc;

use crate::challenge::ChallengeStore;
use crate::client_data::{normalize_key_handle, ClientData};
use crate::device::DeviceRegistration;
use crate::error::{Result, U2fError};
use crate::messages::{AuthenticateRequestMessage, AuthenticateResponse};
use crate::registry::DeviceRegistry;
use crate::request_builder::AuthenticationRequestBuilder;
use crate::session::{SessionBinding, SessionDeviceStatus};
use crate::store::{CeremonyPayload, CeremonyRecord};
use crate::users::UserDirectory;
use crate::verifier::{AuthenticationResponseVerifier, VerifiedAuthentication};

/// Input of [`AuthenticationOrchestrator::start`].
#[derive(Debug, Clone, Default)]
pub struct StartAuthentication {
    pub username: Option<String>,
    pub key_handle: Option<String>,
    /// Falls back to the configured application id.
    pub application: Option<String>,
    pub session_id: Option<String>,
}

impl StartAuthentication {
    pub fn two_step(username: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn one_step(key_handle: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            key_handle: Some(key_handle.into()),
            application: Some(application.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticationOutcome {
    pub request_id: String,
    pub user_id: String,
    pub device: DeviceRegistration,
    pub one_step: bool,
}

#[derive(Clone)]
pub struct AuthenticationOrchestrator {
    app_id: String,
    registry: DeviceRegistry,
    challenges: ChallengeStore,
    builder: AuthenticationRequestBuilder,
    verifier: AuthenticationResponseVerifier,
    users: Arc<dyn UserDirectory>,
    sessions: Arc<dyn SessionBinding>,
}

impl AuthenticationOrchestrator {
    pub fn new(
        app_id: impl Into<String>,
        registry: DeviceRegistry,
        challenges: ChallengeStore,
        builder: AuthenticationRequestBuilder,
        verifier: AuthenticationResponseVerifier,
        users: Arc<dyn UserDirectory>,
        sessions: Arc<dyn SessionBinding>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            registry,
            challenges,
            builder,
            verifier,
            users,
            sessions,
        }
    }

    /// Issue challenges for every eligible device and store the ceremony.
    pub async fn start(&self, input: StartAuthentication) -> Result<AuthenticateRequestMessage> {
        let application = input.application.as_deref().unwrap_or(&self.app_id);

        let user_id = match (input.username.as_deref(), input.key_handle.as_deref()) {
            (Some(username), _) => {
                let session_id = input.session_id.as_deref().ok_or_else(|| {
                    U2fError::bad_input("A session id is required when a username is given")
                })?;
                if !self.sessions.is_valid(session_id, username).await? {
                    return Err(U2fError::bad_input(
                        "Session id does not exist or is not valid for this user",
                    ));
                }
                self.resolve_user(username).await?
            }
            (None, Some(key_handle)) => {
                let key_handle = normalize_key_handle(key_handle)?;
                let device = self
                    .registry
                    .find_by_key_handle(application, &key_handle)
                    .await?
                    .ok_or_else(|| {
                        U2fError::bad_input("No device is registered with this key handle")
                    })?;
                device
                    .user_id
                    .ok_or_else(|| U2fError::bad_input("Device is not attached to a user"))?
            }
            (None, None) => {
                return Err(U2fError::bad_input(
                    "Either a username or a key handle is required",
                ))
            }
        };

        let devices = self
            .registry
            .find_eligible_by_user(&user_id, Some(application))
            .await?;
        let message = self.builder.build(application, &devices)?;

        let request_id = self
            .challenges
            .create(
                CeremonyPayload::Authentication(message.clone()),
                Some(user_id.clone()),
                input.session_id.clone(),
            )
            .await?;

        tracing::info!(
            request_id = %request_id,
            user_id = %user_id,
            devices = message.authenticate_requests.len(),
            one_step = input.username.is_none(),
            "Authentication started"
        );

        Ok(message)
    }

    /// Verify a device response and propagate the outcome to the bound session.
    pub async fn finish(
        &self,
        username: Option<&str>,
        response: &AuthenticateResponse,
    ) -> Result<AuthenticationOutcome> {
        let client_data = self.verifier.receive(response)?;
        let record = self.challenges.consume(client_data.request_id()).await?;
        let one_step = username.is_none();

        let result = self
            .complete(username, &record, &client_data, response)
            .await;

        match result {
            Ok(verified) => {
                if let Some(session_id) = record.session_id.as_deref() {
                    let status = SessionDeviceStatus {
                        user_id: Some(verified.user_id.clone()),
                        device_id: verified.device.id.clone(),
                        one_step,
                        enroll: false,
                    };
                    self.sessions.mark_succeeded(session_id, &status).await?;
                }

                tracing::info!(
                    request_id = %record.request_id,
                    user_id = %verified.user_id,
                    device_id = %verified.device.id,
                    counter = ?verified.device.counter,
                    "Authentication succeeded"
                );

                Ok(AuthenticationOutcome {
                    request_id: record.request_id,
                    user_id: verified.user_id,
                    device: verified.device,
                    one_step,
                })
            }
            Err(err) => {
                if let U2fError::DeviceCompromised(device) = &err {
                    tracing::warn!(
                        request_id = %record.request_id,
                        device_id = %device.id,
                        "Rejected response from compromised device"
                    );
                    if let Err(disable_err) = self.registry.disable(device).await {
                        tracing::error!(
                            device_id = %device.id,
                            error = %disable_err,
                            "Failed to disable device"
                        );
                    }
                }
                self.decline(&record).await;
                Err(err)
            }
        }
    }

    async fn complete(
        &self,
        username: Option<&str>,
        record: &CeremonyRecord,
        client_data: &ClientData,
        response: &AuthenticateResponse,
    ) -> Result<VerifiedAuthentication> {
        if let Some(username) = username {
            let user_id = self.resolve_user(username).await?;
            if record.user_id.as_deref() != Some(user_id.as_str()) {
                return Err(U2fError::bad_input(
                    "Request was not issued for this user",
                ));
            }
        }
        self.verifier.verify(record, client_data, response).await
    }

    async fn resolve_user(&self, username: &str) -> Result<String> {
        self.users
            .resolve_user_id(username)
            .await?
            .ok_or_else(|| U2fError::bad_input(format!("Unknown user {}", username)))
    }

    /// Best-effort; never replaces the error being reported.
    async fn decline(&self, record: &CeremonyRecord) {
        if let Some(session_id) = record.session_id.as_deref() {
            if let Err(e) = self.sessions.mark_declined(session_id).await {
                tracing::warn!(
                    request_id = %record.request_id,
                    session_id = %session_id,
                    error = %e,
                    "Failed to mark session declined"
                );
            }
        }
    }
}

impl std::fmt::Debug for AuthenticationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationOrchestrator")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}
