//! Authentication response validation.
//!
//! A response moves through receive → correlate → resolve → signature →
//! counter. Every failure is terminal for its ceremony; the client has to
//! start over with a fresh challenge.

use std::sync::Arc;

use crate::client_data::{decode_web_safe, normalize_key_handle, ClientData, AUTHENTICATE_TYP};
use crate::crypto::SignatureVerifier;
use crate::device::DeviceRegistration;
use crate::error::{Result, U2fError};
use crate::messages::{AuthenticateResponse, RawAuthenticateResponse};
use crate::registry::DeviceRegistry;
use crate::store::{CeremonyPayload, CeremonyRecord};

/// A response that passed every check.
#[derive(Debug, Clone)]
pub struct VerifiedAuthentication {
    pub user_id: String,
    pub device: DeviceRegistration,
}

#[derive(Clone)]
pub struct AuthenticationResponseVerifier {
    registry: DeviceRegistry,
    signatures: Arc<dyn SignatureVerifier>,
    facets: Vec<String>,
}

impl AuthenticationResponseVerifier {
    pub fn new(
        registry: DeviceRegistry,
        signatures: Arc<dyn SignatureVerifier>,
        facets: Vec<String>,
    ) -> Self {
        Self {
            registry,
            signatures,
            facets,
        }
    }

    /// Parse the client data. Runs before the ceremony is consumed so a
    /// malformed response leaves the ceremony intact.
    pub fn receive(&self, response: &AuthenticateResponse) -> Result<ClientData> {
        response.client_data()
    }

    /// Validate `response` against the consumed ceremony `record`.
    pub async fn verify(
        &self,
        record: &CeremonyRecord,
        client_data: &ClientData,
        response: &AuthenticateResponse,
    ) -> Result<VerifiedAuthentication> {
        let CeremonyPayload::Authentication(message) = &record.payload else {
            return Err(U2fError::bad_input(format!(
                "Request {} is not an authentication request",
                record.request_id
            )));
        };

        let key_handle = normalize_key_handle(&response.key_handle)?;
        let request = message.find_by_key_handle(&key_handle).ok_or_else(|| {
            U2fError::bad_input("Key handle was not challenged in this request")
        })?;

        client_data.check_content(AUTHENTICATE_TYP, &request.challenge, &self.facets)?;

        let device = self
            .registry
            .find_by_key_handle(&request.app_id, &key_handle)
            .await?
            .ok_or_else(|| U2fError::bad_input("Failed to find DeviceRegistration for key handle"))?;

        let user_id = device
            .user_id
            .clone()
            .ok_or_else(|| U2fError::bad_input("Device is not attached to a user"))?;
        if let Some(expected) = record.user_id.as_deref() {
            if expected != user_id {
                return Err(U2fError::bad_input("Device does not belong to the requesting user"));
            }
        }

        if device.is_compromised() {
            return Err(U2fError::DeviceCompromised(Box::new(device)));
        }
        if !device.is_active() {
            return Err(U2fError::bad_input(format!(
                "Device {} is {}",
                device.id, device.status
            )));
        }

        let signature_data = decode_web_safe(&response.signature_data).map_err(|e| {
            U2fError::bad_input(format!("signatureData is not web-safe base64: {}", e))
        })?;
        let raw = RawAuthenticateResponse::parse(&signature_data)?;
        if !raw.user_present() {
            return Err(U2fError::bad_input("User presence is not asserted"));
        }

        let signed = raw.signed_bytes(&request.app_id, &client_data.hash());
        let valid = self
            .signatures
            .verify(&device.public_key, &signed, &raw.signature)?;
        if !valid {
            tracing::warn!(device_id = %device.id, "Authentication signature rejected");
            return Err(U2fError::bad_input("Signature verification failed"));
        }

        let device = self.registry.apply_counter(&device, raw.counter).await?;

        Ok(VerifiedAuthentication { user_id, device })
    }
}

impl std::fmt::Debug for AuthenticationResponseVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationResponseVerifier")
            .field("facets", &self.facets)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_data::encode_web_safe;
    use crate::crypto::OpenSslVerifier;
    use crate::messages::{AuthenticateRequest, AuthenticateRequestMessage};
    use crate::store::MemoryDirectory;
    use crate::testing::SoftToken;
    use chrono::{Duration, Utc};

    const APP: &str = "https://app.example";
    const ORIGIN: &str = "https://app.example";

    struct Fixture {
        verifier: AuthenticationResponseVerifier,
        registry: DeviceRegistry,
        token: SoftToken,
        device: DeviceRegistration,
        record: CeremonyRecord,
    }

    async fn fixture(stored_counter: u32) -> Fixture {
        let registry = DeviceRegistry::new(Arc::new(MemoryDirectory::new()));
        let token = SoftToken::new();
        let device = registry
            .enroll(
                DeviceRegistration::new(
                    APP,
                    token.key_handle(),
                    token.public_key(),
                    token.certificate_der(),
                )
                .with_user("alice")
                .with_counter(stored_counter),
            )
            .await
            .unwrap();

        let now = Utc::now();
        let record = CeremonyRecord {
            request_id: "challenge-1".to_string(),
            session_id: None,
            user_id: Some("alice".to_string()),
            creation_date: now,
            expiration_date: now + Duration::seconds(60),
            payload: CeremonyPayload::Authentication(AuthenticateRequestMessage {
                authenticate_requests: vec![AuthenticateRequest::new(
                    "challenge-1".to_string(),
                    APP,
                    token.key_handle(),
                )],
            }),
        };

        let verifier = AuthenticationResponseVerifier::new(
            registry.clone(),
            Arc::new(OpenSslVerifier::new()),
            vec![ORIGIN.to_string()],
        );

        Fixture {
            verifier,
            registry,
            token,
            device,
            record,
        }
    }

    async fn run(f: &Fixture, response: &AuthenticateResponse) -> Result<VerifiedAuthentication> {
        let client_data = f.verifier.receive(response)?;
        f.verifier.verify(&f.record, &client_data, response).await
    }

    #[tokio::test]
    async fn test_valid_response_advances_counter() {
        let f = fixture(5).await;
        let response = f.token.authenticate(APP, "challenge-1", ORIGIN, 6);

        let verified = run(&f, &response).await.unwrap();
        assert_eq!(verified.user_id, "alice");
        assert_eq!(verified.device.counter, Some(6));
    }

    #[tokio::test]
    async fn test_replayed_counter_is_compromise() {
        let f = fixture(5).await;
        let response = f.token.authenticate(APP, "challenge-1", ORIGIN, 5);

        let err = run(&f, &response).await.unwrap_err();
        assert!(matches!(err, U2fError::DeviceCompromised(_)));
        let stored = f.registry.find_by_id(&f.device.id).await.unwrap().unwrap();
        assert!(stored.is_compromised());
    }

    #[tokio::test]
    async fn test_already_compromised_device() {
        let f = fixture(5).await;
        f.registry.disable(&f.device).await.unwrap();
        let response = f.token.authenticate(APP, "challenge-1", ORIGIN, 9);

        assert!(matches!(
            run(&f, &response).await.unwrap_err(),
            U2fError::DeviceCompromised(_)
        ));
    }

    #[tokio::test]
    async fn test_wrong_signer_is_bad_input() {
        let f = fixture(5).await;
        let impostor = SoftToken::new();
        let mut response = impostor.authenticate(APP, "challenge-1", ORIGIN, 6);
        response.key_handle = f.token.key_handle();

        let err = run(&f, &response).await.unwrap_err();
        assert!(matches!(err, U2fError::BadInput(msg) if msg.contains("Signature")));
        let stored = f.registry.find_by_id(&f.device.id).await.unwrap().unwrap();
        assert_eq!(stored.counter, Some(5));
    }

    #[tokio::test]
    async fn test_unknown_key_handle_is_bad_input() {
        let f = fixture(5).await;
        let mut response = f.token.authenticate(APP, "challenge-1", ORIGIN, 6);
        response.key_handle = encode_web_safe(b"never-issued");

        assert!(matches!(
            run(&f, &response).await.unwrap_err(),
            U2fError::BadInput(_)
        ));
    }

    #[tokio::test]
    async fn test_wrong_origin_or_typ() {
        let f = fixture(5).await;
        let response = f
            .token
            .authenticate(APP, "challenge-1", "https://evil.example", 6);
        assert!(run(&f, &response).await.is_err());

        let response = f.token.authenticate_with(
            APP,
            "challenge-1",
            ORIGIN,
            6,
            0x01,
            "navigator.id.finishEnrollment",
        );
        assert!(matches!(
            run(&f, &response).await.unwrap_err(),
            U2fError::BadInput(_)
        ));
    }

    #[tokio::test]
    async fn test_user_presence_required() {
        let f = fixture(5).await;
        let response =
            f.token
                .authenticate_with(APP, "challenge-1", ORIGIN, 6, 0x00, AUTHENTICATE_TYP);
        let err = run(&f, &response).await.unwrap_err();
        assert!(matches!(err, U2fError::BadInput(msg) if msg.contains("presence")));
    }

    #[tokio::test]
    async fn test_other_users_device_is_rejected() {
        let mut f = fixture(5).await;
        f.record.user_id = Some("bob".to_string());
        let response = f.token.authenticate(APP, "challenge-1", ORIGIN, 6);
        assert!(matches!(
            run(&f, &response).await.unwrap_err(),
            U2fError::BadInput(_)
        ));
    }
}
