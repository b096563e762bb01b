//! Application state module
//!
//! Defines shared state accessible across all request handlers.

use std::sync::Arc;

use u2f_core::{
    Collaborators, MemoryCollaborators, MemorySessionBinding, MemoryUserDirectory, OpenSslVerifier,
    OsRandom, StorageError, U2fEngine, U2fSettings,
};

use crate::config::Config;
use crate::storage::PostgresDirectory;

/// Storage behind the engine
#[derive(Clone)]
pub enum Backend {
    /// PostgreSQL storage (production)
    Postgres(Arc<PostgresDirectory>),
    /// In-memory storage (development and tests), with handles for seeding
    /// users and sessions
    Memory {
        users: Arc<MemoryUserDirectory>,
        sessions: Arc<MemorySessionBinding>,
    },
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Postgres(_) => "postgres",
            Backend::Memory { .. } => "memory",
        }
    }
}

/// Application state containing shared resources.
#[derive(Clone)]
pub struct AppState {
    /// U2F ceremonies over the selected backend
    pub engine: Arc<U2fEngine>,
    pub backend: Backend,
}

impl AppState {
    /// Build state from configuration, connecting to PostgreSQL when
    /// `DATABASE_URL` is set.
    pub async fn from_config(config: &Config) -> Result<Self, StorageError> {
        let settings = config.u2f_settings();

        let Some(database_url) = config.database_url.as_deref() else {
            tracing::warn!(
                "DATABASE_URL not set - using in-memory storage, devices will be lost on restart!"
            );
            return Ok(Self::in_memory(settings));
        };

        let directory = Arc::new(
            PostgresDirectory::connect(
                database_url,
                config.database_max_connections,
                config.database_min_connections,
            )
            .await?,
        );
        directory.migrate().await?;

        let collaborators = Collaborators {
            devices: directory.clone(),
            ceremonies: directory.clone(),
            users: directory.clone(),
            sessions: directory.clone(),
            signatures: Arc::new(OpenSslVerifier::new()),
            random: Arc::new(OsRandom),
        };

        Ok(Self {
            engine: Arc::new(U2fEngine::new(settings, collaborators)),
            backend: Backend::Postgres(directory),
        })
    }

    /// Create with in-memory storage
    pub fn in_memory(settings: U2fSettings) -> Self {
        let memory = MemoryCollaborators::new();
        let engine = U2fEngine::new(settings, memory.collaborators());
        Self {
            engine: Arc::new(engine),
            backend: Backend::Memory {
                users: memory.users,
                sessions: memory.sessions,
            },
        }
    }

    /// In-memory user directory, when that backend is active
    pub fn memory_users(&self) -> Option<&Arc<MemoryUserDirectory>> {
        match &self.backend {
            Backend::Memory { users, .. } => Some(users),
            Backend::Postgres(_) => None,
        }
    }

    /// In-memory session store, when that backend is active
    pub fn memory_sessions(&self) -> Option<&Arc<MemorySessionBinding>> {
        match &self.backend {
            Backend::Memory { sessions, .. } => Some(sessions),
            Backend::Postgres(_) => None,
        }
    }
}
