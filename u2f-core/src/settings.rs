//! Relying-party settings for U2F ceremonies

use chrono::Duration;

/// Default lifetime of an issued request (2 minutes).
pub const DEFAULT_REQUEST_TTL_SECS: i64 = 120;

/// Default lifetime of an unconfirmed enrollment (1 hour).
pub const DEFAULT_ENROLLMENT_TTL_SECS: i64 = 3600;

/// Engine-wide protocol settings.
#[derive(Debug, Clone)]
pub struct U2fSettings {
    /// Application id used when a caller does not supply one.
    pub app_id: String,
    /// Allowed client-data origins. Empty disables the origin check.
    pub facets: Vec<String>,
    pub request_ttl: Duration,
    pub enrollment_ttl: Duration,
}

impl U2fSettings {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    pub fn with_facets(mut self, facets: Vec<String>) -> Self {
        self.facets = facets;
        self
    }

    pub fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    pub fn with_enrollment_ttl(mut self, ttl: Duration) -> Self {
        self.enrollment_ttl = ttl;
        self
    }
}

impl Default for U2fSettings {
    fn default() -> Self {
        Self {
            app_id: "https://localhost:8443".to_string(),
            facets: Vec::new(),
            request_ttl: Duration::seconds(DEFAULT_REQUEST_TTL_SECS),
            enrollment_ttl: Duration::seconds(DEFAULT_ENROLLMENT_TTL_SECS),
        }
    }
}
