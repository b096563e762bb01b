//! Signature verification and challenge entropy.
//!
//! The engine only talks to these through the [`SignatureVerifier`] and
//! [`SecureRandom`] traits. OpenSSL backs the production implementations;
//! [`SeededRandom`] exists for deterministic tests.

use std::sync::atomic::{AtomicU64, Ordering};

use openssl::bn::BigNumContext;
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Public};
use openssl::sign::Verifier;
use openssl::x509::X509;
use thiserror::Error;

/// Length of an uncompressed P-256 point (0x04 || X || Y).
pub const P256_PUBLIC_KEY_BYTES: usize = 65;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid attestation certificate: {0}")]
    InvalidCertificate(String),
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    openssl::sha::sha256(data)
}

/// Verifies ECDSA signatures produced by U2F authenticators.
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` over `signed_bytes` with a raw uncompressed P-256 public key.
    fn verify(
        &self,
        public_key: &[u8],
        signed_bytes: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError>;

    /// Verify `signature` over `signed_bytes` with the key of a DER attestation certificate.
    fn verify_attestation(
        &self,
        certificate_der: &[u8],
        signed_bytes: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError>;
}

/// Source of challenge bytes.
pub trait SecureRandom: Send + Sync {
    fn bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError>;
}

/// OpenSSL-backed ECDSA-SHA256 verifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenSslVerifier;

impl OpenSslVerifier {
    pub fn new() -> Self {
        Self
    }

    fn p256_key(public_key: &[u8]) -> Result<PKey<Public>, CryptoError> {
        if public_key.len() != P256_PUBLIC_KEY_BYTES || public_key[0] != 0x04 {
            return Err(CryptoError::InvalidPublicKey(format!(
                "expected {} byte uncompressed point, got {} bytes",
                P256_PUBLIC_KEY_BYTES,
                public_key.len()
            )));
        }

        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let mut ctx = BigNumContext::new()?;
        let point = EcPoint::from_bytes(&group, public_key, &mut ctx)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let ec_key = EcKey::from_public_key(&group, &point)?;
        ec_key
            .check_key()
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

        Ok(PKey::from_ec_key(ec_key)?)
    }

    fn verify_with(
        pkey: &PKeyRef<Public>,
        signed_bytes: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), pkey)?;
        verifier.update(signed_bytes)?;
        // A malformed DER signature surfaces as an error stack; it is simply not valid.
        Ok(verifier.verify(signature).unwrap_or(false))
    }
}

impl SignatureVerifier for OpenSslVerifier {
    fn verify(
        &self,
        public_key: &[u8],
        signed_bytes: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let pkey = Self::p256_key(public_key)?;
        Self::verify_with(&pkey, signed_bytes, signature)
    }

    fn verify_attestation(
        &self,
        certificate_der: &[u8],
        signed_bytes: &[u8],
        signature: &[u8],
    ) -> Result<bool, CryptoError> {
        let certificate = X509::from_der(certificate_der)
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        let pkey = certificate
            .public_key()
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
        Self::verify_with(&pkey, signed_bytes, signature)
    }
}

/// Operating-system CSPRNG via OpenSSL.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl SecureRandom for OsRandom {
    fn bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; len];
        openssl::rand::rand_bytes(&mut buf)?;
        Ok(buf)
    }
}

/// Deterministic byte source for tests.
/// WARNING: Do not use in production - challenges are predictable!
#[derive(Debug)]
pub struct SeededRandom {
    seed: u64,
    calls: AtomicU64,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            calls: AtomicU64::new(0),
        }
    }
}

impl Default for SeededRandom {
    fn default() -> Self {
        Self::new(0xDEADBEEF_CAFEBABE)
    }
}

impl SecureRandom for SeededRandom {
    fn bytes(&self, len: usize) -> Result<Vec<u8>, CryptoError> {
        // Every call yields a distinct stream so repeated challenges never collide.
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::with_capacity(len);
        let mut block = 0u64;
        while out.len() < len {
            let mut input = Vec::with_capacity(32);
            input.extend_from_slice(&self.seed.to_le_bytes());
            input.extend_from_slice(&call.to_le_bytes());
            input.extend_from_slice(&block.to_le_bytes());
            input.extend_from_slice(b"u2f-seeded-random");
            out.extend_from_slice(&sha256(&input));
            block += 1;
        }
        out.truncate(len);
        Ok(out)
    }
}
