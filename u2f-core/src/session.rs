//! Propagation of ceremony outcomes to the caller's browser session.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::store::StorageError;

/// What the session learns about a successful ceremony.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDeviceStatus {
    pub user_id: Option<String>,
    pub device_id: String,
    /// The ceremony was started from a key handle rather than a username.
    pub one_step: bool,
    /// `true` for registration, `false` for authentication.
    pub enroll: bool,
}

#[async_trait]
pub trait SessionBinding: Send + Sync {
    /// Whether the session may still run a ceremony for `username`.
    async fn is_valid(&self, session_id: &str, username: &str) -> Result<bool, StorageError>;

    async fn mark_succeeded(
        &self,
        session_id: &str,
        status: &SessionDeviceStatus,
    ) -> Result<(), StorageError>;

    async fn mark_declined(&self, session_id: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Succeeded(SessionDeviceStatus),
    Declined,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    username: Option<String>,
    state: SessionState,
}

/// In-memory session store for development and tests.
#[derive(Debug, Default)]
pub struct MemorySessionBinding {
    sessions: DashMap<String, SessionEntry>,
}

impl MemorySessionBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pending session. `username` of `None` accepts any user.
    pub fn open(&self, session_id: impl Into<String>, username: Option<&str>) {
        self.sessions.insert(
            session_id.into(),
            SessionEntry {
                username: username.map(str::to_string),
                state: SessionState::Pending,
            },
        );
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|entry| entry.state.clone())
    }
}

#[async_trait]
impl SessionBinding for MemorySessionBinding {
    async fn is_valid(&self, session_id: &str, username: &str) -> Result<bool, StorageError> {
        Ok(self.sessions.get(session_id).is_some_and(|entry| {
            entry.state == SessionState::Pending
                && entry.username.as_deref().map_or(true, |u| u == username)
        }))
    }

    async fn mark_succeeded(
        &self,
        session_id: &str,
        status: &SessionDeviceStatus,
    ) -> Result<(), StorageError> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound(format!("session {}", session_id)))?;
        entry.state = SessionState::Succeeded(status.clone());
        Ok(())
    }

    async fn mark_declined(&self, session_id: &str) -> Result<(), StorageError> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound(format!("session {}", session_id)))?;
        entry.state = SessionState::Declined;
        Ok(())
    }
}
