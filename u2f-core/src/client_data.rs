//! Browser client-data codec.
//!
//! The browser hands back `clientData` as web-safe base64 over a small JSON
//! document. Its `challenge` field is the correlation key for the ceremony and
//! the SHA-256 of the raw bytes is part of every signed U2F payload.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;

use crate::crypto::sha256;
use crate::error::{Result, U2fError};

/// `typ` of client data produced by `u2f.sign`.
pub const AUTHENTICATE_TYP: &str = "navigator.id.getAssertion";
/// `typ` of client data produced by `u2f.register`.
pub const REGISTER_TYP: &str = "navigator.id.finishEnrollment";

/// Encode bytes as unpadded web-safe base64.
pub fn encode_web_safe(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode web-safe base64, tolerating trailing padding.
pub fn decode_web_safe(value: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(value.trim_end_matches('='))
}

/// Re-encode a key handle supplied in any common base64 alphabet into the
/// canonical unpadded web-safe form used as the directory key.
pub fn normalize_key_handle(key_handle: &str) -> Result<String> {
    let trimmed = key_handle.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| U2fError::bad_input(format!("Key handle is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(U2fError::bad_input("Key handle is empty"));
    }
    Ok(encode_web_safe(&bytes))
}

#[derive(Debug, Deserialize)]
struct WireClientData {
    typ: Option<String>,
    challenge: Option<String>,
    origin: Option<String>,
    #[serde(default)]
    cid_pubkey: Option<serde_json::Value>,
}

/// Parsed client data. Never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientData {
    pub typ: String,
    pub challenge: String,
    pub origin: String,
    /// Channel id binding, when the browser supplied one.
    pub cid_pubkey: Option<serde_json::Value>,
    raw: Vec<u8>,
}

impl ClientData {
    /// Decode the browser-supplied `clientData` field.
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = decode_web_safe(encoded).map_err(|e| {
            U2fError::bad_input(format!("clientData is not web-safe base64: {}", e))
        })?;

        let wire: WireClientData = serde_json::from_slice(&raw)
            .map_err(|e| U2fError::bad_input(format!("clientData is not valid JSON: {}", e)))?;

        let typ = wire
            .typ
            .ok_or_else(|| U2fError::bad_input("clientData is missing 'typ'"))?;
        let challenge = wire
            .challenge
            .ok_or_else(|| U2fError::bad_input("clientData is missing 'challenge'"))?;
        let origin = wire
            .origin
            .ok_or_else(|| U2fError::bad_input("clientData is missing 'origin'"))?;

        Ok(Self {
            typ,
            challenge,
            origin,
            cid_pubkey: wire.cid_pubkey,
            raw,
        })
    }

    /// The ceremony correlation key carried by this client data.
    pub fn request_id(&self) -> &str {
        &self.challenge
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// SHA-256 of the raw decoded bytes, as signed by the authenticator.
    pub fn hash(&self) -> [u8; 32] {
        sha256(&self.raw)
    }

    /// Check type, challenge and (when facets are configured) origin.
    pub fn check_content(
        &self,
        expected_typ: &str,
        expected_challenge: &str,
        facets: &[String],
    ) -> Result<()> {
        if self.typ != expected_typ {
            return Err(U2fError::bad_input(format!(
                "Bad clientData: wrong typ '{}', expected '{}'",
                self.typ, expected_typ
            )));
        }

        if self.challenge != expected_challenge {
            return Err(U2fError::bad_input("Bad clientData: wrong challenge"));
        }

        if !facets.is_empty() && !facets.iter().any(|facet| facet == &self.origin) {
            return Err(U2fError::bad_input(format!(
                "Bad clientData: origin '{}' is not an allowed facet",
                self.origin
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_json(json: &str) -> String {
        encode_web_safe(json.as_bytes())
    }

    #[test]
    fn test_decode_valid_client_data() {
        let encoded = encode_json(
            r#"{"typ":"navigator.id.getAssertion","challenge":"abc","origin":"https://example.com"}"#,
        );
        let client_data = ClientData::decode(&encoded).unwrap();

        assert_eq!(client_data.typ, AUTHENTICATE_TYP);
        assert_eq!(client_data.request_id(), "abc");
        assert_eq!(client_data.origin, "https://example.com");
        assert!(client_data.cid_pubkey.is_none());
        assert_eq!(client_data.hash(), sha256(client_data.raw()));
    }

    #[test]
    fn test_decode_accepts_padding() {
        let json = r#"{"typ":"t","challenge":"c","origin":"o"}"#;
        let padded = base64::engine::general_purpose::URL_SAFE.encode(json);
        assert!(padded.ends_with('='));
        assert_eq!(ClientData::decode(&padded).unwrap().challenge, "c");
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let err = ClientData::decode("!!not-base64!!").unwrap_err();
        assert!(matches!(err, U2fError::BadInput(_)));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = ClientData::decode(&encode_web_safe(b"plain text")).unwrap_err();
        assert!(matches!(err, U2fError::BadInput(msg) if msg.contains("JSON")));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        for json in [
            r#"{"challenge":"c","origin":"o"}"#,
            r#"{"typ":"t","origin":"o"}"#,
            r#"{"typ":"t","challenge":"c"}"#,
        ] {
            let err = ClientData::decode(&encode_json(json)).unwrap_err();
            assert!(matches!(err, U2fError::BadInput(_)), "accepted {}", json);
        }
    }

    #[test]
    fn test_check_content() {
        let client_data = ClientData::decode(&encode_json(
            r#"{"typ":"navigator.id.getAssertion","challenge":"abc","origin":"https://a.example"}"#,
        ))
        .unwrap();

        assert!(client_data
            .check_content(AUTHENTICATE_TYP, "abc", &[])
            .is_ok());
        assert!(client_data
            .check_content(AUTHENTICATE_TYP, "abc", &["https://a.example".to_string()])
            .is_ok());
        assert!(client_data.check_content(REGISTER_TYP, "abc", &[]).is_err());
        assert!(client_data
            .check_content(AUTHENTICATE_TYP, "other", &[])
            .is_err());
        assert!(client_data
            .check_content(AUTHENTICATE_TYP, "abc", &["https://b.example".to_string()])
            .is_err());
    }

    #[test]
    fn test_normalize_key_handle() {
        let bytes = [0xfb, 0xff, 0x01, 0x02];
        let standard = base64::engine::general_purpose::STANDARD.encode(bytes);
        let web_safe = encode_web_safe(&bytes);

        assert_eq!(normalize_key_handle(&standard).unwrap(), web_safe);
        assert_eq!(normalize_key_handle(&web_safe).unwrap(), web_safe);
        assert!(normalize_key_handle("").is_err());
        assert!(normalize_key_handle("***").is_err());
    }
}
