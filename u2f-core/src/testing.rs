//! Software U2F token for tests.
//!
//! WARNING: Do not use in production - keys live in process memory.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use crate::client_data::{decode_web_safe, encode_web_safe, AUTHENTICATE_TYP, REGISTER_TYP};
use crate::crypto::sha256;
use crate::messages::{AuthenticateResponse, RegisterResponse, USER_PRESENCE_FLAG};

/// A P-256 credential plus a self-signed attestation certificate.
pub struct SoftToken {
    credential: PKey<Private>,
    attestation: PKey<Private>,
    certificate: X509,
    key_handle: Vec<u8>,
}

impl SoftToken {
    pub fn new() -> Self {
        let credential = generate_p256();
        let attestation = generate_p256();
        let certificate = self_signed(&attestation);

        let mut key_handle = vec![0u8; 64];
        openssl::rand::rand_bytes(&mut key_handle).expect("rand_bytes");

        Self {
            credential,
            attestation,
            certificate,
            key_handle,
        }
    }

    /// Web-safe base64 key handle.
    pub fn key_handle(&self) -> String {
        encode_web_safe(&self.key_handle)
    }

    /// Uncompressed credential public key.
    pub fn public_key(&self) -> Vec<u8> {
        let ec = self.credential.ec_key().expect("ec key");
        let mut ctx = BigNumContext::new().expect("bn ctx");
        ec.public_key()
            .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
            .expect("encode point")
    }

    pub fn certificate_der(&self) -> Vec<u8> {
        self.certificate.to_der().expect("certificate der")
    }

    /// DER ECDSA-SHA256 signature with the credential key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        sign_with(&self.credential, message)
    }

    /// DER ECDSA-SHA256 signature with the attestation key.
    pub fn sign_attestation(&self, message: &[u8]) -> Vec<u8> {
        sign_with(&self.attestation, message)
    }

    pub fn client_data(typ: &str, challenge: &str, origin: &str) -> String {
        let json = serde_json::json!({
            "typ": typ,
            "challenge": challenge,
            "origin": origin,
        });
        encode_web_safe(json.to_string().as_bytes())
    }

    /// Answer an authentication challenge with user presence asserted.
    pub fn authenticate(
        &self,
        app_id: &str,
        challenge: &str,
        origin: &str,
        counter: u32,
    ) -> AuthenticateResponse {
        self.authenticate_with(
            app_id,
            challenge,
            origin,
            counter,
            USER_PRESENCE_FLAG,
            AUTHENTICATE_TYP,
        )
    }

    pub fn authenticate_with(
        &self,
        app_id: &str,
        challenge: &str,
        origin: &str,
        counter: u32,
        flags: u8,
        typ: &str,
    ) -> AuthenticateResponse {
        let client_data = Self::client_data(typ, challenge, origin);
        let client_data_raw = decode_web_safe(&client_data).expect("decode");

        let mut signed = Vec::new();
        signed.extend_from_slice(&sha256(app_id.as_bytes()));
        signed.push(flags);
        signed.extend_from_slice(&counter.to_be_bytes());
        signed.extend_from_slice(&sha256(&client_data_raw));

        let mut signature_data = vec![flags];
        signature_data.extend_from_slice(&counter.to_be_bytes());
        signature_data.extend_from_slice(&self.sign(&signed));

        AuthenticateResponse {
            client_data,
            signature_data: encode_web_safe(&signature_data),
            key_handle: self.key_handle(),
        }
    }

    /// Answer a registration challenge.
    pub fn register(&self, app_id: &str, challenge: &str, origin: &str) -> RegisterResponse {
        let client_data = Self::client_data(REGISTER_TYP, challenge, origin);
        let client_data_raw = decode_web_safe(&client_data).expect("decode");
        let public_key = self.public_key();

        let mut signed = vec![0x00];
        signed.extend_from_slice(&sha256(app_id.as_bytes()));
        signed.extend_from_slice(&sha256(&client_data_raw));
        signed.extend_from_slice(&self.key_handle);
        signed.extend_from_slice(&public_key);

        let mut registration_data = vec![0x05];
        registration_data.extend_from_slice(&public_key);
        registration_data.push(self.key_handle.len() as u8);
        registration_data.extend_from_slice(&self.key_handle);
        registration_data.extend_from_slice(&self.certificate_der());
        registration_data.extend_from_slice(&self.sign_attestation(&signed));

        RegisterResponse {
            registration_data: encode_web_safe(&registration_data),
            client_data,
        }
    }
}

impl Default for SoftToken {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_p256() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("p256 group");
    let key = EcKey::generate(&group).expect("generate key");
    PKey::from_ec_key(key).expect("pkey")
}

fn sign_with(key: &PKey<Private>, message: &[u8]) -> Vec<u8> {
    let mut signer = Signer::new(MessageDigest::sha256(), key).expect("signer");
    signer.update(message).expect("update");
    signer.sign_to_vec().expect("sign")
}

fn self_signed(key: &PKey<Private>) -> X509 {
    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("CN", "Soft U2F Token")
        .expect("cn");
    let name = name.build();

    let mut builder = X509Builder::new().expect("x509 builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(1)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("set serial");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(key).expect("pubkey");
    builder
        .set_not_before(&Asn1Time::days_from_now(0).expect("not before"))
        .expect("set not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(365).expect("not after"))
        .expect("set not after");
    builder.sign(key, MessageDigest::sha256()).expect("sign cert");
    builder.build()
}
