//! Device enrollment ceremonies.

use std::sync::Arc;

use chrono::Duration;

use crate::challenge::ChallengeStore;
use crate::client_data::{decode_web_safe, encode_web_safe, ClientData, REGISTER_TYP};
use crate::crypto::{CryptoError, SignatureVerifier};
use crate::device::DeviceRegistration;
use crate::error::{Result, U2fError};
use crate::messages::{
    RawRegisterResponse, RegisterRequest, RegisterRequestMessage, RegisterResponse,
};
use crate::registry::DeviceRegistry;
use crate::request_builder::AuthenticationRequestBuilder;
use crate::session::{SessionBinding, SessionDeviceStatus};
use crate::store::{CeremonyPayload, CeremonyRecord};
use crate::users::UserDirectory;

#[derive(Debug, Clone, Default)]
pub struct StartRegistration {
    /// `None` starts a one-step enrollment that is attached to a user later.
    pub username: Option<String>,
    pub application: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub request_id: String,
    pub device: DeviceRegistration,
    pub one_step: bool,
}

#[derive(Clone)]
pub struct RegistrationService {
    app_id: String,
    facets: Vec<String>,
    enrollment_ttl: Duration,
    registry: DeviceRegistry,
    challenges: ChallengeStore,
    builder: AuthenticationRequestBuilder,
    signatures: Arc<dyn SignatureVerifier>,
    users: Arc<dyn UserDirectory>,
    sessions: Arc<dyn SessionBinding>,
}

impl RegistrationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_id: impl Into<String>,
        facets: Vec<String>,
        enrollment_ttl: Duration,
        registry: DeviceRegistry,
        challenges: ChallengeStore,
        builder: AuthenticationRequestBuilder,
        signatures: Arc<dyn SignatureVerifier>,
        users: Arc<dyn UserDirectory>,
        sessions: Arc<dyn SessionBinding>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            facets,
            enrollment_ttl,
            registry,
            challenges,
            builder,
            signatures,
            users,
            sessions,
        }
    }

    /// Issue a registration challenge. Devices the user already owns are
    /// listed so the token can refuse to enroll twice.
    pub async fn start(&self, input: StartRegistration) -> Result<RegisterRequestMessage> {
        let application = input.application.as_deref().unwrap_or(&self.app_id);

        if let Some(session_id) = input.session_id.as_deref() {
            let username = input.username.as_deref().unwrap_or_default();
            if !self.sessions.is_valid(session_id, username).await? {
                return Err(U2fError::bad_input(
                    "Session id does not exist or is not valid for this user",
                ));
            }
        }

        let user_id = match input.username.as_deref() {
            Some(username) => Some(self.resolve_user(username).await?),
            None => None,
        };

        let authenticate_requests = match user_id.as_deref() {
            Some(user_id) => {
                let devices = self
                    .registry
                    .find_active_by_user(user_id, Some(application))
                    .await?;
                if devices.is_empty() {
                    Vec::new()
                } else {
                    self.builder
                        .build(application, &devices)?
                        .authenticate_requests
                }
            }
            None => Vec::new(),
        };

        let message = RegisterRequestMessage {
            register_requests: vec![RegisterRequest::new(
                self.builder.generate_challenge()?,
                application,
            )],
            authenticate_requests,
        };

        let request_id = self
            .challenges
            .create(
                CeremonyPayload::Registration(message.clone()),
                user_id.clone(),
                input.session_id.clone(),
            )
            .await?;

        tracing::info!(
            request_id = %request_id,
            user_id = user_id.as_deref().unwrap_or("-"),
            existing_devices = message.authenticate_requests.len(),
            "Registration started"
        );

        Ok(message)
    }

    /// Verify the attestation and enroll the new device.
    pub async fn finish(
        &self,
        username: Option<&str>,
        response: &RegisterResponse,
        display_name: Option<String>,
    ) -> Result<RegistrationOutcome> {
        let client_data = response.client_data()?;
        let record = self.challenges.consume(client_data.request_id()).await?;

        match self
            .complete(username, &record, &client_data, response, display_name)
            .await
        {
            Ok(device) => {
                let one_step = device.user_id.is_none();
                if let Some(session_id) = record.session_id.as_deref() {
                    let status = SessionDeviceStatus {
                        user_id: device.user_id.clone(),
                        device_id: device.id.clone(),
                        one_step,
                        enroll: true,
                    };
                    self.sessions.mark_succeeded(session_id, &status).await?;
                }

                tracing::info!(
                    request_id = %record.request_id,
                    device_id = %device.id,
                    one_step,
                    "Registration succeeded"
                );

                Ok(RegistrationOutcome {
                    request_id: record.request_id,
                    device,
                    one_step,
                })
            }
            Err(err) => {
                if let Some(session_id) = record.session_id.as_deref() {
                    if let Err(e) = self.sessions.mark_declined(session_id).await {
                        tracing::warn!(
                            request_id = %record.request_id,
                            error = %e,
                            "Failed to mark session declined"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Make a provisional enrollment permanent.
    pub async fn confirm(&self, device_id: &str) -> Result<()> {
        self.registry.confirm(device_id).await
    }

    /// Bind a one-step enrollment to `username` and confirm it.
    pub async fn attach(&self, username: &str, device_id: &str) -> Result<DeviceRegistration> {
        let user_id = self.resolve_user(username).await?;
        self.registry.attach(&user_id, device_id).await?;
        self.registry.confirm(device_id).await?;
        self.registry
            .find_by_id(device_id)
            .await?
            .ok_or_else(|| U2fError::server(format!("Device {} vanished after attach", device_id)))
    }

    async fn complete(
        &self,
        username: Option<&str>,
        record: &CeremonyRecord,
        client_data: &ClientData,
        response: &RegisterResponse,
        display_name: Option<String>,
    ) -> Result<DeviceRegistration> {
        let CeremonyPayload::Registration(message) = &record.payload else {
            return Err(U2fError::bad_input(format!(
                "Request {} is not a registration request",
                record.request_id
            )));
        };

        if let Some(username) = username {
            let user_id = self.resolve_user(username).await?;
            if record.user_id.as_deref() != Some(user_id.as_str()) {
                return Err(U2fError::bad_input("Request was not issued for this user"));
            }
        }

        let request = message
            .find_by_challenge(client_data.request_id())
            .ok_or_else(|| U2fError::bad_input("Challenge was not issued in this request"))?;
        client_data.check_content(REGISTER_TYP, &request.challenge, &self.facets)?;

        let registration_data = decode_web_safe(&response.registration_data).map_err(|e| {
            U2fError::bad_input(format!("registrationData is not web-safe base64: {}", e))
        })?;
        let raw = RawRegisterResponse::parse(&registration_data)?;

        let signed = raw.signed_bytes(&request.app_id, &client_data.hash());
        let valid = self
            .signatures
            .verify_attestation(&raw.attestation_certificate, &signed, &raw.signature)
            .map_err(|e| match e {
                CryptoError::InvalidCertificate(msg) => U2fError::bad_input(msg),
                other => U2fError::Crypto(other),
            })?;
        if !valid {
            return Err(U2fError::bad_input("Attestation signature verification failed"));
        }

        let mut device = DeviceRegistration::new(
            request.app_id.clone(),
            encode_web_safe(&raw.key_handle),
            raw.public_key,
            raw.attestation_certificate,
        )
        .with_expiration(self.enrollment_ttl);
        if let Some(user_id) = record.user_id.as_deref() {
            device = device.with_user(user_id);
        }
        if let Some(name) = display_name {
            device = device.with_display_name(name);
        }

        let device = self.registry.enroll(device).await?;

        // Enrollments made by a known user are final; one-step ones wait for attach.
        if device.user_id.is_some() {
            self.registry.confirm(&device.id).await?;
            return self
                .registry
                .find_by_id(&device.id)
                .await?
                .ok_or_else(|| U2fError::server("Enrolled device not found"));
        }
        Ok(device)
    }

    async fn resolve_user(&self, username: &str) -> Result<String> {
        self.users
            .resolve_user_id(username)
            .await?
            .ok_or_else(|| U2fError::bad_input(format!("Unknown user {}", username)))
    }
}

impl std::fmt::Debug for RegistrationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationService")
            .field("app_id", &self.app_id)
            .field("enrollment_ttl_secs", &self.enrollment_ttl.num_seconds())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SeededRandom;
    use crate::engine::{MemoryCollaborators, U2fEngine};
    use crate::orchestrator::StartAuthentication;
    use crate::session::SessionState;
    use crate::settings::U2fSettings;
    use crate::testing::SoftToken;

    const APP: &str = "https://app.example";
    const ORIGIN: &str = "https://app.example";

    fn harness() -> (U2fEngine, MemoryCollaborators) {
        let memory = MemoryCollaborators::new();
        memory.users.insert("alice", "inum-alice");
        memory.sessions.open("s1", Some("alice"));
        let engine = U2fEngine::new(
            U2fSettings::new(APP).with_facets(vec![ORIGIN.to_string()]),
            memory.collaborators_with_random(Arc::new(SeededRandom::new(42))),
        );
        (engine, memory)
    }

    fn register_challenge(message: &RegisterRequestMessage) -> &str {
        &message.register_requests[0].challenge
    }

    #[tokio::test]
    async fn test_two_step_registration_then_authentication() {
        let (engine, memory) = harness();
        let token = SoftToken::new();

        let message = engine
            .registration
            .start(StartRegistration {
                username: Some("alice".to_string()),
                application: None,
                session_id: Some("s1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(message.register_requests.len(), 1);
        assert!(message.authenticate_requests.is_empty());

        let response = token.register(APP, register_challenge(&message), ORIGIN);
        let outcome = engine
            .registration
            .finish(Some("alice"), &response, Some("Desk key".to_string()))
            .await
            .unwrap();

        assert!(!outcome.one_step);
        assert_eq!(outcome.device.user_id.as_deref(), Some("inum-alice"));
        assert_eq!(outcome.device.key_handle, token.key_handle());
        assert_eq!(outcome.device.public_key, token.public_key());
        assert_eq!(outcome.device.display_name.as_deref(), Some("Desk key"));
        assert!(outcome.device.expiration_date.is_none());
        assert!(matches!(
            memory.sessions.state("s1"),
            Some(SessionState::Succeeded(status)) if status.enroll
        ));

        memory.sessions.open("s2", Some("alice"));
        let auth = engine
            .authentication
            .start(StartAuthentication::two_step("alice", "s2"))
            .await
            .unwrap();
        let response = token.authenticate(APP, &auth.authenticate_requests[0].challenge, ORIGIN, 1);
        assert!(engine
            .authentication
            .finish(Some("alice"), &response)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_first_authentication_may_report_counter_zero() {
        let (engine, memory) = harness();
        let token = SoftToken::new();

        let message = engine
            .registration
            .start(StartRegistration {
                username: Some("alice".to_string()),
                ..StartRegistration::default()
            })
            .await
            .unwrap();
        let enrolled = engine
            .registration
            .finish(None, &token.register(APP, register_challenge(&message), ORIGIN), None)
            .await
            .unwrap();
        assert_eq!(enrolled.device.counter, None);

        memory.sessions.open("s2", Some("alice"));
        let auth = engine
            .authentication
            .start(StartAuthentication::two_step("alice", "s2"))
            .await
            .unwrap();
        let response = token.authenticate(APP, &auth.authenticate_requests[0].challenge, ORIGIN, 0);
        let outcome = engine
            .authentication
            .finish(Some("alice"), &response)
            .await
            .unwrap();
        assert_eq!(outcome.device.counter, Some(0));
        assert!(outcome.device.is_active());

        // Once observed, the same value is a regression.
        memory.sessions.open("s3", Some("alice"));
        let auth = engine
            .authentication
            .start(StartAuthentication::two_step("alice", "s3"))
            .await
            .unwrap();
        let replay = token.authenticate(APP, &auth.authenticate_requests[0].challenge, ORIGIN, 0);
        let err = engine
            .authentication
            .finish(Some("alice"), &replay)
            .await
            .unwrap_err();
        assert!(matches!(err, U2fError::DeviceCompromised(_)));
    }

    #[tokio::test]
    async fn test_existing_devices_are_listed() {
        let (engine, memory) = harness();
        let first = SoftToken::new();

        let message = engine
            .registration
            .start(StartRegistration {
                username: Some("alice".to_string()),
                ..StartRegistration::default()
            })
            .await
            .unwrap();
        engine
            .registration
            .finish(None, &first.register(APP, register_challenge(&message), ORIGIN), None)
            .await
            .unwrap();

        memory.sessions.open("s2", Some("alice"));
        let message = engine
            .registration
            .start(StartRegistration {
                username: Some("alice".to_string()),
                application: None,
                session_id: Some("s2".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(message.authenticate_requests.len(), 1);
        assert_eq!(message.authenticate_requests[0].key_handle, first.key_handle());
    }

    #[tokio::test]
    async fn test_one_step_enrollment_is_provisional_until_attached() {
        let (engine, _memory) = harness();
        let token = SoftToken::new();

        let message = engine
            .registration
            .start(StartRegistration::default())
            .await
            .unwrap();
        let outcome = engine
            .registration
            .finish(None, &token.register(APP, register_challenge(&message), ORIGIN), None)
            .await
            .unwrap();

        assert!(outcome.one_step);
        assert!(outcome.device.user_id.is_none());
        assert!(outcome.device.expiration_date.is_some());

        // Not usable for authentication before it has an owner.
        assert!(engine
            .authentication
            .start(StartAuthentication::one_step(token.key_handle(), APP))
            .await
            .is_err());

        let attached = engine
            .registration
            .attach("alice", &outcome.device.id)
            .await
            .unwrap();
        assert_eq!(attached.user_id.as_deref(), Some("inum-alice"));
        assert!(attached.expiration_date.is_none());
        assert!(!attached.deletable);

        assert!(engine
            .authentication
            .start(StartAuthentication::one_step(token.key_handle(), APP))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let (engine, _memory) = harness();
        let token = SoftToken::new();

        for expect_ok in [true, false] {
            let message = engine
                .registration
                .start(StartRegistration::default())
                .await
                .unwrap();
            let result = engine
                .registration
                .finish(None, &token.register(APP, register_challenge(&message), ORIGIN), None)
                .await;
            assert_eq!(result.is_ok(), expect_ok);
        }
    }

    #[tokio::test]
    async fn test_tampered_attestation_is_bad_input() {
        let (engine, _memory) = harness();
        let token = SoftToken::new();

        let message = engine
            .registration
            .start(StartRegistration::default())
            .await
            .unwrap();
        // Signed over a different application id.
        let response = token.register("https://evil.example", register_challenge(&message), ORIGIN);

        let err = engine
            .registration
            .finish(None, &response, None)
            .await
            .unwrap_err();
        assert!(matches!(err, U2fError::BadInput(msg) if msg.contains("Attestation")));
        assert_eq!(engine.challenges().pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_authentication_ceremony_cannot_finish_registration() {
        let (engine, _memory) = harness();
        let token = SoftToken::new();
        engine
            .registry()
            .enroll(
                DeviceRegistration::new(APP, token.key_handle(), token.public_key(), vec![])
                    .with_user("inum-alice"),
            )
            .await
            .unwrap();

        let auth = engine
            .authentication
            .start(StartAuthentication::one_step(token.key_handle(), APP))
            .await
            .unwrap();
        let response = token.register(APP, &auth.authenticate_requests[0].challenge, ORIGIN);

        let err = engine
            .registration
            .finish(None, &response, None)
            .await
            .unwrap_err();
        assert!(matches!(err, U2fError::BadInput(msg) if msg.contains("not a registration")));
    }

    #[tokio::test]
    async fn test_unknown_user_is_bad_input() {
        let (engine, _memory) = harness();
        let err = engine
            .registration
            .start(StartRegistration {
                username: Some("mallory".to_string()),
                ..StartRegistration::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, U2fError::BadInput(_)));
    }
}
