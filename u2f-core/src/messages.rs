//! U2F protocol messages.
//!
//! Field names follow the `u2f-api.js` wire shape (camelCase) so browser
//! payloads deserialize without translation.

use serde::{Deserialize, Serialize};

use crate::client_data::ClientData;
use crate::crypto::{sha256, P256_PUBLIC_KEY_BYTES};
use crate::error::{Result, U2fError};

/// Protocol version advertised in every request.
pub const U2F_VERSION: &str = "U2F_V2";

/// Bit 0 of the authentication flags byte.
pub const USER_PRESENCE_FLAG: u8 = 0x01;

const REGISTRATION_RESERVED_BYTE: u8 = 0x05;
const REGISTRATION_SIGNED_PREFIX: u8 = 0x00;

/// One outstanding challenge for exactly one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub version: String,
    pub challenge: String,
    pub app_id: String,
    pub key_handle: String,
}

impl AuthenticateRequest {
    pub fn new(challenge: String, app_id: impl Into<String>, key_handle: impl Into<String>) -> Self {
        Self {
            version: U2F_VERSION.to_string(),
            challenge,
            app_id: app_id.into(),
            key_handle: key_handle.into(),
        }
    }
}

/// All challenges issued in one authentication ceremony.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequestMessage {
    pub authenticate_requests: Vec<AuthenticateRequest>,
}

impl AuthenticateRequestMessage {
    /// The challenge of the first request identifies the ceremony.
    pub fn request_id(&self) -> Option<&str> {
        self.authenticate_requests
            .first()
            .map(|request| request.challenge.as_str())
    }

    pub fn challenges(&self) -> impl Iterator<Item = &str> {
        self.authenticate_requests
            .iter()
            .map(|request| request.challenge.as_str())
    }

    pub fn find_by_key_handle(&self, key_handle: &str) -> Option<&AuthenticateRequest> {
        self.authenticate_requests
            .iter()
            .find(|request| request.key_handle == key_handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub version: String,
    pub challenge: String,
    pub app_id: String,
}

impl RegisterRequest {
    pub fn new(challenge: String, app_id: impl Into<String>) -> Self {
        Self {
            version: U2F_VERSION.to_string(),
            challenge,
            app_id: app_id.into(),
        }
    }
}

/// Enrollment ceremony. Already-enrolled devices are listed as authenticate
/// requests so a token can refuse to register twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequestMessage {
    pub register_requests: Vec<RegisterRequest>,
    pub authenticate_requests: Vec<AuthenticateRequest>,
}

impl RegisterRequestMessage {
    pub fn request_id(&self) -> Option<&str> {
        self.register_requests
            .first()
            .map(|request| request.challenge.as_str())
    }

    pub fn challenges(&self) -> impl Iterator<Item = &str> {
        self.register_requests
            .iter()
            .map(|request| request.challenge.as_str())
    }

    pub fn find_by_challenge(&self, challenge: &str) -> Option<&RegisterRequest> {
        self.register_requests
            .iter()
            .find(|request| request.challenge == challenge)
    }
}

/// Response of `u2f.sign`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    pub client_data: String,
    pub signature_data: String,
    pub key_handle: String,
}

impl AuthenticateResponse {
    pub fn client_data(&self) -> Result<ClientData> {
        ClientData::decode(&self.client_data)
    }

    pub fn request_id(&self) -> Result<String> {
        Ok(self.client_data()?.challenge)
    }
}

/// Response of `u2f.register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub registration_data: String,
    pub client_data: String,
}

impl RegisterResponse {
    pub fn client_data(&self) -> Result<ClientData> {
        ClientData::decode(&self.client_data)
    }
}

/// Decoded `signatureData`: flags, counter and DER signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAuthenticateResponse {
    pub user_presence: u8,
    pub counter: u32,
    pub signature: Vec<u8>,
}

impl RawAuthenticateResponse {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() <= 5 {
            return Err(U2fError::bad_input(format!(
                "signatureData too short: {} bytes",
                data.len()
            )));
        }

        let user_presence = data[0];
        let counter = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);

        Ok(Self {
            user_presence,
            counter,
            signature: data[5..].to_vec(),
        })
    }

    pub fn user_present(&self) -> bool {
        self.user_presence & USER_PRESENCE_FLAG == USER_PRESENCE_FLAG
    }

    /// `sha256(app_id) || flags || counter || client_data_hash`
    pub fn signed_bytes(&self, app_id: &str, client_data_hash: &[u8; 32]) -> Vec<u8> {
        let mut signed = Vec::with_capacity(32 + 1 + 4 + 32);
        signed.extend_from_slice(&sha256(app_id.as_bytes()));
        signed.push(self.user_presence);
        signed.extend_from_slice(&self.counter.to_be_bytes());
        signed.extend_from_slice(client_data_hash);
        signed
    }
}

/// Decoded `registrationData`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRegisterResponse {
    pub public_key: Vec<u8>,
    pub key_handle: Vec<u8>,
    pub attestation_certificate: Vec<u8>,
    pub signature: Vec<u8>,
}

impl RawRegisterResponse {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (&reserved, rest) = data
            .split_first()
            .ok_or_else(|| U2fError::bad_input("registrationData is empty"))?;
        if reserved != REGISTRATION_RESERVED_BYTE {
            return Err(U2fError::bad_input(format!(
                "registrationData has reserved byte {:#04x}, expected {:#04x}",
                reserved, REGISTRATION_RESERVED_BYTE
            )));
        }

        if rest.len() < P256_PUBLIC_KEY_BYTES + 1 {
            return Err(U2fError::bad_input("registrationData truncated in public key"));
        }
        let (public_key, rest) = rest.split_at(P256_PUBLIC_KEY_BYTES);
        if public_key[0] != 0x04 {
            return Err(U2fError::bad_input("Public key is not an uncompressed point"));
        }

        let key_handle_len = usize::from(rest[0]);
        let rest = &rest[1..];
        if key_handle_len == 0 || rest.len() < key_handle_len {
            return Err(U2fError::bad_input("registrationData truncated in key handle"));
        }
        let (key_handle, rest) = rest.split_at(key_handle_len);

        let certificate_len = der_element_len(rest)?;
        let (attestation_certificate, signature) = rest.split_at(certificate_len);
        if signature.is_empty() {
            return Err(U2fError::bad_input("registrationData has no signature"));
        }

        Ok(Self {
            public_key: public_key.to_vec(),
            key_handle: key_handle.to_vec(),
            attestation_certificate: attestation_certificate.to_vec(),
            signature: signature.to_vec(),
        })
    }

    /// `0x00 || sha256(app_id) || client_data_hash || key_handle || public_key`
    pub fn signed_bytes(&self, app_id: &str, client_data_hash: &[u8; 32]) -> Vec<u8> {
        let mut signed =
            Vec::with_capacity(1 + 32 + 32 + self.key_handle.len() + self.public_key.len());
        signed.push(REGISTRATION_SIGNED_PREFIX);
        signed.extend_from_slice(&sha256(app_id.as_bytes()));
        signed.extend_from_slice(client_data_hash);
        signed.extend_from_slice(&self.key_handle);
        signed.extend_from_slice(&self.public_key);
        signed
    }
}

/// Total length (header included) of the DER SEQUENCE at the start of `data`.
fn der_element_len(data: &[u8]) -> Result<usize> {
    let truncated = || U2fError::bad_input("registrationData truncated in attestation certificate");

    if data.len() < 2 || data[0] != 0x30 {
        return Err(U2fError::bad_input(
            "Attestation certificate is not a DER sequence",
        ));
    }

    let first = data[1];
    let (content_len, header_len) = if first & 0x80 == 0 {
        (usize::from(first), 2)
    } else {
        let octets = usize::from(first & 0x7f);
        if octets == 0 || octets > 4 {
            return Err(U2fError::bad_input(
                "Attestation certificate has an unsupported DER length",
            ));
        }
        let length_bytes = data.get(2..2 + octets).ok_or_else(truncated)?;
        let len = length_bytes
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        (len, 2 + octets)
    };

    let total = header_len + content_len;
    if total > data.len() {
        return Err(truncated());
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(challenges: &[(&str, &str)]) -> AuthenticateRequestMessage {
        AuthenticateRequestMessage {
            authenticate_requests: challenges
                .iter()
                .map(|(challenge, kh)| AuthenticateRequest::new(challenge.to_string(), "app", *kh))
                .collect(),
        }
    }

    #[test]
    fn test_request_id_is_first_challenge() {
        let msg = message(&[("c1", "kh1"), ("c2", "kh2")]);
        assert_eq!(msg.request_id(), Some("c1"));
        assert_eq!(msg.challenges().collect::<Vec<_>>(), vec!["c1", "c2"]);
        assert_eq!(msg.find_by_key_handle("kh2").unwrap().challenge, "c2");
        assert!(msg.find_by_key_handle("kh3").is_none());
        assert_eq!(message(&[]).request_id(), None);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = message(&[("c1", "kh1")]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["authenticateRequests"][0]["keyHandle"], "kh1");
        assert_eq!(json["authenticateRequests"][0]["appId"], "app");
        assert_eq!(json["authenticateRequests"][0]["version"], U2F_VERSION);

        let response: AuthenticateResponse = serde_json::from_str(
            r#"{"clientData":"a","signatureData":"b","keyHandle":"c"}"#,
        )
        .unwrap();
        assert_eq!(response.key_handle, "c");
    }

    #[test]
    fn test_parse_signature_data() {
        let data = [0x01, 0x00, 0x00, 0x01, 0x02, 0x30, 0x44];
        let raw = RawAuthenticateResponse::parse(&data).unwrap();
        assert!(raw.user_present());
        assert_eq!(raw.counter, 258);
        assert_eq!(raw.signature, vec![0x30, 0x44]);

        let signed = raw.signed_bytes("app", &[7u8; 32]);
        assert_eq!(signed.len(), 69);
        assert_eq!(&signed[..32], &sha256(b"app"));
        assert_eq!(signed[32], 0x01);
        assert_eq!(&signed[33..37], &[0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_parse_signature_data_too_short() {
        assert!(RawAuthenticateResponse::parse(&[0x01, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_user_presence_not_set() {
        let raw = RawAuthenticateResponse::parse(&[0x00, 0, 0, 0, 1, 0x30]).unwrap();
        assert!(!raw.user_present());
    }

    fn registration_data(certificate: &[u8]) -> Vec<u8> {
        let mut data = vec![REGISTRATION_RESERVED_BYTE, 0x04];
        data.extend_from_slice(&[0xAA; 64]);
        data.push(3);
        data.extend_from_slice(&[1, 2, 3]);
        data.extend_from_slice(certificate);
        data.extend_from_slice(&[0x30, 0x45, 0x02]);
        data
    }

    #[test]
    fn test_parse_registration_data_short_form_certificate() {
        let certificate = [0x30, 0x03, 0x01, 0x02, 0x03];
        let raw = RawRegisterResponse::parse(&registration_data(&certificate)).unwrap();

        assert_eq!(raw.public_key.len(), P256_PUBLIC_KEY_BYTES);
        assert_eq!(raw.key_handle, vec![1, 2, 3]);
        assert_eq!(raw.attestation_certificate, certificate.to_vec());
        assert_eq!(raw.signature, vec![0x30, 0x45, 0x02]);

        let signed = raw.signed_bytes("app", &[9u8; 32]);
        assert_eq!(signed[0], 0x00);
        assert_eq!(signed.len(), 1 + 32 + 32 + 3 + 65);
    }

    #[test]
    fn test_parse_registration_data_long_form_certificate() {
        let mut certificate = vec![0x30, 0x82, 0x01, 0x00];
        certificate.extend(std::iter::repeat(0x11).take(256));
        let raw = RawRegisterResponse::parse(&registration_data(&certificate)).unwrap();
        assert_eq!(raw.attestation_certificate.len(), 260);
    }

    #[test]
    fn test_parse_registration_data_errors() {
        assert!(RawRegisterResponse::parse(&[]).is_err());

        let mut wrong_reserved = registration_data(&[0x30, 0x00]);
        wrong_reserved[0] = 0x04;
        assert!(RawRegisterResponse::parse(&wrong_reserved).is_err());

        // Certificate claims more bytes than remain.
        assert!(RawRegisterResponse::parse(&registration_data(&[0x30, 0x7f])).is_err());

        // No signature after the certificate.
        let mut no_signature = registration_data(&[0x30, 0x00]);
        no_signature.truncate(no_signature.len() - 3);
        assert!(RawRegisterResponse::parse(&no_signature).is_err());
    }
}
