//! U2F Core - FIDO U2F authentication and registration engine
//!
//! This crate implements the relying-party side of the FIDO U2F
//! challenge-response protocol: issuing challenges, validating signed
//! device responses and enforcing the signature-counter anti-cloning rule.
//!
//! # Features
//!
//! - Two-step (username + session) and one-step (key handle) authentication
//! - Device enrollment with attestation verification
//! - Single-use, TTL-bound ceremony records resolvable by any issued challenge
//! - Compromised-device detection with automatic disable
//! - Storage, user, session and crypto collaborators injected as traits
//!
//! # Example
//!
//! ```no_run
//! use u2f_core::{MemoryCollaborators, StartAuthentication, U2fEngine, U2fSettings};
//!
//! # async fn example() -> u2f_core::Result<()> {
//! let memory = MemoryCollaborators::new();
//! memory.users.insert("alice", "inum-alice");
//! memory.sessions.open("session-1", Some("alice"));
//!
//! let engine = U2fEngine::new(
//!     U2fSettings::new("https://app.example"),
//!     memory.collaborators(),
//! );
//!
//! // Challenge every active device of alice
//! let request = engine
//!     .authentication
//!     .start(StartAuthentication::two_step("alice", "session-1"))
//!     .await?;
//! println!("{}", serde_json::to_string(&request).unwrap());
//! # Ok(())
//! # }
//! ```

pub mod challenge;
pub mod client_data;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod messages;
pub mod orchestrator;
pub mod registration;
pub mod registry;
pub mod request_builder;
pub mod session;
pub mod settings;
pub mod store;
pub mod users;
pub mod verifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types for convenience
pub use challenge::ChallengeStore;
pub use client_data::{ClientData, AUTHENTICATE_TYP, REGISTER_TYP};
pub use crypto::{
    CryptoError, OpenSslVerifier, OsRandom, SecureRandom, SeededRandom, SignatureVerifier,
};
pub use device::{DeviceRegistration, DeviceStatus};
pub use engine::{Collaborators, MemoryCollaborators, U2fEngine};
pub use error::{Result, U2fError};
pub use messages::{
    AuthenticateRequest, AuthenticateRequestMessage, AuthenticateResponse, RegisterRequest,
    RegisterRequestMessage, RegisterResponse, U2F_VERSION,
};
pub use orchestrator::{AuthenticationOrchestrator, AuthenticationOutcome, StartAuthentication};
pub use registration::{RegistrationOutcome, RegistrationService, StartRegistration};
pub use registry::DeviceRegistry;
pub use request_builder::AuthenticationRequestBuilder;
pub use session::{MemorySessionBinding, SessionBinding, SessionDeviceStatus, SessionState};
pub use settings::U2fSettings;
pub use store::{
    CeremonyDirectory, CeremonyPayload, CeremonyRecord, CounterUpdate, DeviceDirectory,
    MemoryDirectory, StorageError,
};
pub use users::{MemoryUserDirectory, UserDirectory};
pub use verifier::{AuthenticationResponseVerifier, VerifiedAuthentication};
