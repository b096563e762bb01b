//! Enrolled authenticator records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    /// Terminal. A compromised device never authenticates again.
    Compromised,
    Migrated,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Compromised => "compromised",
            DeviceStatus::Migrated => "migrated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(DeviceStatus::Active),
            "compromised" => Some(DeviceStatus::Compromised),
            "migrated" => Some(DeviceStatus::Migrated),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub id: String,
    /// Owning user. `None` until a one-step enrollment is attached.
    pub user_id: Option<String>,
    pub application: String,
    /// Unpadded web-safe base64.
    pub key_handle: String,
    pub key_handle_hash_code: i32,
    /// Uncompressed P-256 point.
    pub public_key: Vec<u8>,
    /// DER, fixed at enrollment.
    pub attestation_certificate: Vec<u8>,
    /// Last authentication counter seen; `None` until the first sign.
    pub counter: Option<u32>,
    pub status: DeviceStatus,
    pub display_name: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub last_access_time: Option<DateTime<Utc>>,
    /// Provisional enrollments expire unless confirmed.
    pub expiration_date: Option<DateTime<Utc>>,
    pub deletable: bool,
}

impl DeviceRegistration {
    pub fn new(
        application: impl Into<String>,
        key_handle: impl Into<String>,
        public_key: Vec<u8>,
        attestation_certificate: Vec<u8>,
    ) -> Self {
        let key_handle = key_handle.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            application: application.into(),
            key_handle_hash_code: key_handle_hash_code(&key_handle),
            key_handle,
            public_key,
            attestation_certificate,
            counter: None,
            status: DeviceStatus::Active,
            display_name: None,
            creation_date: Utc::now(),
            last_access_time: None,
            expiration_date: None,
            deletable: true,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_counter(mut self, counter: u32) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration_date = Some(self.creation_date + ttl);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }

    pub fn is_compromised(&self) -> bool {
        self.status == DeviceStatus::Compromised
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|expires| now >= expires)
    }

    pub fn belongs_to(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    /// Confirmed enrollments are permanent.
    pub fn clear_expiration(&mut self) {
        self.expiration_date = None;
        self.deletable = false;
    }
}

/// 31-multiplier fold over UTF-16 code units, wrapping at 32 bits.
///
/// Stored alongside each registration as a narrow lookup column; key handles
/// sharing a hash are disambiguated by full comparison.
pub fn key_handle_hash_code(key_handle: &str) -> i32 {
    key_handle
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_handle_hash_code() {
        assert_eq!(key_handle_hash_code(""), 0);
        assert_eq!(key_handle_hash_code("a"), 97);
        assert_eq!(key_handle_hash_code("hello"), 99162322);
        // Wraps instead of overflowing.
        let long = "z".repeat(64);
        let _ = key_handle_hash_code(&long);
    }

    #[test]
    fn test_new_device_is_active_and_deletable() {
        let device = DeviceRegistration::new("app", "kh", vec![4; 65], vec![0x30]);
        assert!(device.is_active());
        assert!(!device.is_compromised());
        assert!(device.deletable);
        assert_eq!(device.key_handle_hash_code, key_handle_hash_code("kh"));
        assert!(device.user_id.is_none());
        assert_eq!(device.counter, None);
    }

    #[test]
    fn test_expiration_lifecycle() {
        let mut device = DeviceRegistration::new("app", "kh", vec![4; 65], vec![0x30])
            .with_expiration(Duration::seconds(60));
        let later = device.creation_date + Duration::seconds(61);

        assert!(!device.is_expired(device.creation_date));
        assert!(device.is_expired(device.creation_date + Duration::seconds(60)));
        assert!(device.is_expired(later));

        device.clear_expiration();
        assert!(!device.is_expired(later));
        assert!(!device.deletable);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            DeviceStatus::Active,
            DeviceStatus::Compromised,
            DeviceStatus::Migrated,
        ] {
            assert_eq!(DeviceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeviceStatus::parse("unknown"), None);
    }
}
