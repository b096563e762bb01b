//! Single-use, TTL-bound ceremony storage.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::error::{Result, U2fError};
use crate::store::{CeremonyDirectory, CeremonyPayload, CeremonyRecord};

#[derive(Clone)]
pub struct ChallengeStore {
    directory: Arc<dyn CeremonyDirectory>,
    ttl: Duration,
}

impl ChallengeStore {
    pub fn new(directory: Arc<dyn CeremonyDirectory>, ttl: Duration) -> Self {
        Self { directory, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Persist a freshly issued request and return its request id.
    pub async fn create(
        &self,
        payload: CeremonyPayload,
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<String> {
        let request_id = payload
            .request_id()
            .ok_or_else(|| U2fError::server("Ceremony carries no challenge"))?
            .to_string();

        let now = Utc::now();
        let record = CeremonyRecord {
            request_id: request_id.clone(),
            session_id,
            user_id,
            creation_date: now,
            expiration_date: now + self.ttl,
            payload,
        };
        let kind = record.payload.kind();

        if !self.directory.insert(record).await? {
            return Err(U2fError::DuplicateRequestId(request_id));
        }

        tracing::debug!(request_id = %request_id, kind, "Ceremony stored");
        Ok(request_id)
    }

    /// Atomically take the ceremony that issued `challenge`.
    ///
    /// A second call with any challenge of the same ceremony fails with
    /// `SessionExpired`, as does a call after expiry.
    pub async fn consume(&self, challenge: &str) -> Result<CeremonyRecord> {
        self.directory
            .take_by_challenge(challenge)
            .await?
            .ok_or_else(|| U2fError::session_expired(challenge))
    }

    /// Remove expired records (called periodically)
    pub async fn cleanup_expired(&self) -> Result<usize> {
        Ok(self.directory.remove_expired(Utc::now()).await?)
    }

    pub async fn pending(&self) -> Result<usize> {
        Ok(self.directory.count().await?)
    }
}

impl std::fmt::Debug for ChallengeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeStore")
            .field("ttl_secs", &self.ttl.num_seconds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AuthenticateRequest, AuthenticateRequestMessage};
    use crate::store::MemoryDirectory;

    fn payload(challenges: &[&str]) -> CeremonyPayload {
        CeremonyPayload::Authentication(AuthenticateRequestMessage {
            authenticate_requests: challenges
                .iter()
                .map(|c| AuthenticateRequest::new(c.to_string(), "app", format!("kh-{}", c)))
                .collect(),
        })
    }

    fn store(ttl_secs: i64) -> ChallengeStore {
        ChallengeStore::new(Arc::new(MemoryDirectory::new()), Duration::seconds(ttl_secs))
    }

    #[tokio::test]
    async fn test_create_then_consume_once() {
        let store = store(60);
        let request_id = store
            .create(payload(&["c1", "c2"]), Some("alice".into()), Some("s1".into()))
            .await
            .unwrap();
        assert_eq!(request_id, "c1");

        let record = store.consume("c1").await.unwrap();
        assert_eq!(record.user_id.as_deref(), Some("alice"));
        assert_eq!(record.session_id.as_deref(), Some("s1"));
        assert!(record.expiration_date > record.creation_date);

        let err = store.consume("c1").await.unwrap_err();
        assert!(matches!(err, U2fError::SessionExpired { .. }));
    }

    #[tokio::test]
    async fn test_consume_by_secondary_challenge() {
        let store = store(60);
        store.create(payload(&["c1", "c2"]), None, None).await.unwrap();

        assert_eq!(store.consume("c2").await.unwrap().request_id, "c1");
        assert!(store.consume("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_request_id() {
        let store = store(60);
        store.create(payload(&["c1"]), None, None).await.unwrap();
        let err = store.create(payload(&["c1"]), None, None).await.unwrap_err();
        assert!(matches!(err, U2fError::DuplicateRequestId(id) if id == "c1"));
    }

    #[tokio::test]
    async fn test_empty_payload_is_rejected() {
        let store = store(60);
        assert!(store.create(payload(&[]), None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_ceremony_is_session_expired() {
        let store = store(0);
        store.create(payload(&["c1"]), None, None).await.unwrap();

        let err = store.consume("c1").await.unwrap_err();
        assert!(matches!(err, U2fError::SessionExpired { request_id } if request_id == "c1"));
        assert_eq!(store.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = store(0);
        store.create(payload(&["c1"]), None, None).await.unwrap();
        store.create(payload(&["c2"]), None, None).await.unwrap();
        assert_eq!(store.cleanup_expired().await.unwrap(), 2);
        assert_eq!(store.pending().await.unwrap(), 0);
    }
}
