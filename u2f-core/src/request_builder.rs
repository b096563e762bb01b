//! Authentication request construction
//!
//! Issues one fresh challenge per eligible device, most recently used first.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::client_data::encode_web_safe;
use crate::crypto::SecureRandom;
use crate::device::DeviceRegistration;
use crate::error::{Result, U2fError};
use crate::messages::{AuthenticateRequest, AuthenticateRequestMessage};

/// Size of every issued challenge before encoding.
pub const CHALLENGE_SIZE_BYTES: usize = 32;

/// Issues one fresh challenge per eligible device.
#[derive(Clone)]
pub struct AuthenticationRequestBuilder {
    random: Arc<dyn SecureRandom>,
}

impl AuthenticationRequestBuilder {
    pub fn new(random: Arc<dyn SecureRandom>) -> Self {
        Self { random }
    }

    /// 32 random bytes, web-safe base64 encoded.
    pub fn generate_challenge(&self) -> Result<String> {
        let bytes = self.random.bytes(CHALLENGE_SIZE_BYTES)?;
        if bytes.len() != CHALLENGE_SIZE_BYTES {
            return Err(U2fError::server(format!(
                "Random source returned {} bytes, expected {}",
                bytes.len(),
                CHALLENGE_SIZE_BYTES
            )));
        }
        Ok(encode_web_safe(&bytes))
    }

    /// Build a request for every active device in `devices`.
    ///
    /// The most recently used device comes first, so its challenge becomes
    /// the request id.
    pub fn build(
        &self,
        app_id: &str,
        devices: &[DeviceRegistration],
    ) -> Result<AuthenticateRequestMessage> {
        let mut eligible: Vec<&DeviceRegistration> =
            devices.iter().filter(|d| d.is_active()).collect();
        if eligible.is_empty() {
            return Err(U2fError::NoEligibleDevices(
                "No active devices to challenge".to_string(),
            ));
        }
        eligible.sort_by(|a, b| most_recent_first(a, b));

        let authenticate_requests = eligible
            .into_iter()
            .map(|device| {
                Ok(AuthenticateRequest::new(
                    self.generate_challenge()?,
                    app_id,
                    device.key_handle.clone(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AuthenticateRequestMessage {
            authenticate_requests,
        })
    }
}

fn most_recent_first(a: &DeviceRegistration, b: &DeviceRegistration) -> Ordering {
    let by_access = match (a.last_access_time, b.last_access_time) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_access
        .then_with(|| b.creation_date.cmp(&a.creation_date))
        .then_with(|| a.id.cmp(&b.id))
}

impl std::fmt::Debug for AuthenticationRequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationRequestBuilder").finish_non_exhaustive()
    }
}
