//! Persistence seams for devices and in-flight ceremonies.
//!
//! Provides:
//! - **DeviceDirectory**: enrolled authenticators. Counter advancement is a
//!   single conditional write so concurrent finishes cannot both succeed.
//! - **CeremonyDirectory**: short-lived request records keyed by challenge,
//!   consumed exactly once.
//!
//! [`MemoryDirectory`] implements both for development and tests. Durable
//! backends live outside this crate.

mod memory;

pub use memory::MemoryDirectory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceRegistration;
use crate::messages::{AuthenticateRequestMessage, RegisterRequestMessage};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Request message persisted between start and finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum CeremonyPayload {
    Authentication(AuthenticateRequestMessage),
    Registration(RegisterRequestMessage),
}

impl CeremonyPayload {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            CeremonyPayload::Authentication(message) => message.request_id(),
            CeremonyPayload::Registration(message) => message.request_id(),
        }
    }

    /// Every challenge that must resolve back to this ceremony.
    pub fn challenges(&self) -> Vec<String> {
        match self {
            CeremonyPayload::Authentication(message) => {
                message.challenges().map(str::to_string).collect()
            }
            CeremonyPayload::Registration(message) => {
                message.challenges().map(str::to_string).collect()
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CeremonyPayload::Authentication(_) => "authentication",
            CeremonyPayload::Registration(_) => "registration",
        }
    }
}

/// An issued request awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyRecord<P = CeremonyPayload> {
    pub request_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub expiration_date: DateTime<Utc>,
    pub payload: P,
}

impl<P> CeremonyRecord<P> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration_date
    }
}

/// Outcome of a conditional counter write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    Advanced,
    /// The stored counter was not lower, or the device is no longer active.
    Rejected,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Returns `false` when `(application, key_handle)` is already enrolled.
    async fn insert(&self, device: DeviceRegistration) -> Result<bool, StorageError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<DeviceRegistration>, StorageError>;

    async fn find_by_user(
        &self,
        user_id: &str,
        application: Option<&str>,
    ) -> Result<Vec<DeviceRegistration>, StorageError>;

    async fn find_by_key_handle(
        &self,
        application: &str,
        key_handle: &str,
    ) -> Result<Option<DeviceRegistration>, StorageError>;

    /// Store `counter` only if the device is active and `counter` exceeds the
    /// stored value. A device with no stored counter accepts any value.
    /// Also records `accessed_at` as the last access time.
    async fn advance_counter(
        &self,
        id: &str,
        counter: u32,
        accessed_at: DateTime<Utc>,
    ) -> Result<CounterUpdate, StorageError>;

    /// Returns `true` only for the call that performed the transition.
    async fn mark_compromised(&self, id: &str) -> Result<bool, StorageError>;

    async fn clear_expiration(&self, id: &str) -> Result<bool, StorageError>;

    /// Bind an unowned device to a user. Returns `false` if already owned.
    async fn attach_user(&self, id: &str, user_id: &str) -> Result<bool, StorageError>;

    /// Delete provisional enrollments whose expiration has passed.
    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;

    async fn check_health(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
pub trait CeremonyDirectory: Send + Sync {
    /// Returns `false` if the request id or any challenge is already live.
    async fn insert(&self, record: CeremonyRecord) -> Result<bool, StorageError>;

    /// Atomically remove and return the ceremony any of whose challenges
    /// equals `challenge`. Expired records are removed and reported as absent.
    async fn take_by_challenge(
        &self,
        challenge: &str,
    ) -> Result<Option<CeremonyRecord>, StorageError>;

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;

    async fn count(&self) -> Result<usize, StorageError>;
}
