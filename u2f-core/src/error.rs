use thiserror::Error;

use crate::device::DeviceRegistration;
use crate::store::StorageError;

#[derive(Error, Debug)]
pub enum U2fError {
    /// Malformed or mismatched protocol data. The client must restart the ceremony.
    #[error("Bad input: {0}")]
    BadInput(String),

    /// The ceremony record is missing, expired or was already consumed.
    #[error("Ceremony not found or already consumed: {request_id}")]
    SessionExpired { request_id: String },

    #[error("No eligible devices: {0}")]
    NoEligibleDevices(String),

    /// A non-increasing signature counter was observed for this device.
    #[error("Device {} is compromised", .0.id)]
    DeviceCompromised(Box<DeviceRegistration>),

    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Server error: {0}")]
    ServerError(String),
}

impl U2fError {
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::BadInput(message.into())
    }

    pub fn session_expired(request_id: impl Into<String>) -> Self {
        Self::SessionExpired {
            request_id: request_id.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::ServerError(message.into())
    }
}

pub type Result<T> = std::result::Result<T, U2fError>;
