//! Server configuration module
//!
//! Handles loading configuration from environment variables with sensible defaults.

use std::net::SocketAddr;

use url::Url;
use u2f_core::settings::{DEFAULT_ENROLLMENT_TTL_SECS, DEFAULT_REQUEST_TTL_SECS};
use u2f_core::U2fSettings;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid application id: {0}")]
    InvalidAppId(String),
    #[error("Invalid facet '{facet}': {reason}")]
    InvalidFacet { facet: String, reason: String },
    #[error("{0} must be positive")]
    NonPositive(&'static str),
}

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 3000)
    pub port: u16,
    /// Server host (default: 127.0.0.1)
    pub host: [u8; 4],
    /// Allowed CORS origins, comma-separated (default: allow all in dev)
    pub allowed_origins: Option<Vec<String>>,
    /// Request body limit in KB (default: 64)
    pub body_limit_kb: usize,
    /// Request timeout in seconds (default: 30)
    pub timeout_secs: u64,
    /// Enable rate limiting (default: false for tests, true when loaded from env)
    pub rate_limit_enabled: bool,
    /// Rate limit: requests per second (default: 10)
    pub rate_limit_per_sec: u64,
    /// Rate limit: burst size (default: 20)
    pub rate_limit_burst: u32,
    /// PostgreSQL connection string; in-memory storage when unset
    pub database_url: Option<String>,
    /// Database connection pool maximum connections (default: 20)
    pub database_max_connections: u32,
    /// Database connection pool minimum connections (default: 2)
    pub database_min_connections: u32,
    /// U2F application id (default: https://localhost:3000)
    pub app_id: String,
    /// Allowed client-data origins, comma-separated (default: none, origin not checked)
    pub facets: Vec<String>,
    /// Lifetime of an issued request in seconds (default: 120)
    pub request_ttl_secs: i64,
    /// Lifetime of an unconfirmed enrollment in seconds (default: 3600)
    pub enrollment_ttl_secs: i64,
    /// Interval of the expired-record sweep in seconds (default: 60)
    pub cleanup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            host: [127, 0, 0, 1],
            allowed_origins: None, // None = allow all (dev mode)
            body_limit_kb: 64,
            timeout_secs: 30,
            rate_limit_enabled: false, // Disabled by default (for tests)
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
            database_url: None,
            database_max_connections: 20,
            database_min_connections: 2,
            app_id: "https://localhost:3000".to_string(),
            facets: Vec::new(),
            request_ttl_secs: DEFAULT_REQUEST_TTL_SECS,
            enrollment_ttl_secs: DEFAULT_ENROLLMENT_TTL_SECS,
            cleanup_interval_secs: 60,
        }
    }
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);

        let host = std::env::var("HOST")
            .ok()
            .map(|h| {
                if h == "0.0.0.0" {
                    [0, 0, 0, 0]
                } else {
                    [127, 0, 0, 1]
                }
            })
            .unwrap_or(defaults.host);

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|origins| comma_list(&origins));

        let body_limit_kb = std::env::var("BODY_LIMIT_KB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.body_limit_kb);

        let timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        let rate_limit_per_sec = std::env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rate_limit_per_sec);

        let rate_limit_burst = std::env::var("RATE_LIMIT_BURST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rate_limit_burst);

        // Rate limiting enabled by default in production, can be disabled with RATE_LIMIT_ENABLED=false
        let rate_limit_enabled = std::env::var("RATE_LIMIT_ENABLED")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.database_max_connections);

        let database_min_connections = std::env::var("DATABASE_MIN_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.database_min_connections);

        let app_id = std::env::var("U2F_APP_ID").unwrap_or(defaults.app_id);

        let facets = std::env::var("U2F_FACETS")
            .map(|v| comma_list(&v))
            .unwrap_or_default();

        let request_ttl_secs = std::env::var("U2F_REQUEST_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.request_ttl_secs);

        let enrollment_ttl_secs = std::env::var("U2F_ENROLLMENT_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.enrollment_ttl_secs);

        let cleanup_interval_secs = std::env::var("U2F_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.cleanup_interval_secs);

        Self {
            port,
            host,
            allowed_origins,
            body_limit_kb,
            timeout_secs,
            rate_limit_enabled,
            rate_limit_per_sec,
            rate_limit_burst,
            database_url,
            database_max_connections,
            database_min_connections,
            app_id,
            facets,
            request_ttl_secs,
            enrollment_ttl_secs,
            cleanup_interval_secs,
        }
    }

    /// Check the U2F settings before the server starts accepting ceremonies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.app_id).map_err(|e| ConfigError::InvalidAppId(e.to_string()))?;

        for facet in &self.facets {
            let url = Url::parse(facet).map_err(|e| ConfigError::InvalidFacet {
                facet: facet.clone(),
                reason: e.to_string(),
            })?;
            if url.scheme() != "https" && url.host_str() != Some("localhost") {
                return Err(ConfigError::InvalidFacet {
                    facet: facet.clone(),
                    reason: "facets must use https".to_string(),
                });
            }
        }

        if self.request_ttl_secs <= 0 {
            return Err(ConfigError::NonPositive("U2F_REQUEST_TTL_SECS"));
        }
        if self.enrollment_ttl_secs <= 0 {
            return Err(ConfigError::NonPositive("U2F_ENROLLMENT_TTL_SECS"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::NonPositive("U2F_CLEANUP_INTERVAL_SECS"));
        }
        Ok(())
    }

    /// Engine settings derived from this configuration
    pub fn u2f_settings(&self) -> U2fSettings {
        U2fSettings::new(self.app_id.clone())
            .with_facets(self.facets.clone())
            .with_request_ttl(chrono::Duration::seconds(self.request_ttl_secs))
            .with_enrollment_ttl(chrono::Duration::seconds(self.enrollment_ttl_secs))
    }

    /// Get socket address from config
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }
}
