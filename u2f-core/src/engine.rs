//! Wiring of the engine components around injected collaborators.

use std::sync::Arc;

use crate::challenge::ChallengeStore;
use crate::crypto::{OpenSslVerifier, OsRandom, SecureRandom, SignatureVerifier};
use crate::error::Result;
use crate::orchestrator::AuthenticationOrchestrator;
use crate::registration::RegistrationService;
use crate::registry::DeviceRegistry;
use crate::request_builder::AuthenticationRequestBuilder;
use crate::session::{MemorySessionBinding, SessionBinding};
use crate::settings::U2fSettings;
use crate::store::{CeremonyDirectory, DeviceDirectory, MemoryDirectory};
use crate::users::{MemoryUserDirectory, UserDirectory};
use crate::verifier::AuthenticationResponseVerifier;

/// Everything the engine talks to but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub devices: Arc<dyn DeviceDirectory>,
    pub ceremonies: Arc<dyn CeremonyDirectory>,
    pub users: Arc<dyn UserDirectory>,
    pub sessions: Arc<dyn SessionBinding>,
    pub signatures: Arc<dyn SignatureVerifier>,
    pub random: Arc<dyn SecureRandom>,
}

/// In-memory collaborators, with handles kept for seeding users and sessions.
pub struct MemoryCollaborators {
    pub directory: Arc<MemoryDirectory>,
    pub users: Arc<MemoryUserDirectory>,
    pub sessions: Arc<MemorySessionBinding>,
}

impl MemoryCollaborators {
    pub fn new() -> Self {
        Self {
            directory: Arc::new(MemoryDirectory::new()),
            users: Arc::new(MemoryUserDirectory::new()),
            sessions: Arc::new(MemorySessionBinding::new()),
        }
    }

    /// OpenSSL verification with operating-system randomness.
    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with_random(Arc::new(OsRandom))
    }

    pub fn collaborators_with_random(&self, random: Arc<dyn SecureRandom>) -> Collaborators {
        Collaborators {
            devices: self.directory.clone(),
            ceremonies: self.directory.clone(),
            users: self.users.clone(),
            sessions: self.sessions.clone(),
            signatures: Arc::new(OpenSslVerifier::new()),
            random,
        }
    }
}

impl Default for MemoryCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

/// Authentication and registration over one shared device registry and
/// ceremony store.
#[derive(Clone)]
pub struct U2fEngine {
    pub authentication: AuthenticationOrchestrator,
    pub registration: RegistrationService,
    registry: DeviceRegistry,
    challenges: ChallengeStore,
    settings: U2fSettings,
}

impl U2fEngine {
    pub fn new(settings: U2fSettings, collaborators: Collaborators) -> Self {
        let registry = DeviceRegistry::new(collaborators.devices);
        let challenges = ChallengeStore::new(collaborators.ceremonies, settings.request_ttl);
        let builder = AuthenticationRequestBuilder::new(collaborators.random);
        let verifier = AuthenticationResponseVerifier::new(
            registry.clone(),
            collaborators.signatures.clone(),
            settings.facets.clone(),
        );

        let authentication = AuthenticationOrchestrator::new(
            settings.app_id.clone(),
            registry.clone(),
            challenges.clone(),
            builder.clone(),
            verifier,
            collaborators.users.clone(),
            collaborators.sessions.clone(),
        );

        let registration = RegistrationService::new(
            settings.app_id.clone(),
            settings.facets.clone(),
            settings.enrollment_ttl,
            registry.clone(),
            challenges.clone(),
            builder,
            collaborators.signatures,
            collaborators.users,
            collaborators.sessions,
        );

        Self {
            authentication,
            registration,
            registry,
            challenges,
            settings,
        }
    }

    pub fn settings(&self) -> &U2fSettings {
        &self.settings
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    /// Sweep expired ceremonies and unconfirmed enrollments.
    /// Returns `(ceremonies, devices)` removed.
    pub async fn cleanup_expired(&self) -> Result<(usize, usize)> {
        let ceremonies = self.challenges.cleanup_expired().await?;
        let devices = self.registry.remove_expired().await?;
        if ceremonies > 0 || devices > 0 {
            tracing::debug!(ceremonies, devices, "Removed expired records");
        }
        Ok((ceremonies, devices))
    }
}

impl std::fmt::Debug for U2fEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("U2fEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
