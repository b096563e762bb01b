//! Username resolution.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::store::StorageError;

/// Maps login names to stable user ids.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve_user_id(&self, username: &str) -> Result<Option<String>, StorageError>;
}

/// In-memory user directory for development and tests.
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: DashMap<String, String>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, username: impl Into<String>, user_id: impl Into<String>) {
        self.users.insert(username.into(), user_id.into());
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn resolve_user_id(&self, username: &str) -> Result<Option<String>, StorageError> {
        Ok(self.users.get(username).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve() {
        let users = MemoryUserDirectory::new();
        users.insert("alice", "inum-1");
        assert_eq!(
            users.resolve_user_id("alice").await.unwrap().as_deref(),
            Some("inum-1")
        );
        assert!(users.resolve_user_id("bob").await.unwrap().is_none());
    }
}
