//! Device lookup and lifecycle transitions.

use std::sync::Arc;

use chrono::Utc;

use crate::device::DeviceRegistration;
use crate::error::{Result, U2fError};
use crate::store::{CounterUpdate, DeviceDirectory};

/// Enforces the device invariants on top of a [`DeviceDirectory`]:
/// counters only move forward and compromised devices stay out of every
/// ceremony.
#[derive(Clone)]
pub struct DeviceRegistry {
    directory: Arc<dyn DeviceDirectory>,
}

impl DeviceRegistry {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self { directory }
    }

    /// Active devices of `user_id`, optionally restricted to one application.
    pub async fn find_active_by_user(
        &self,
        user_id: &str,
        application: Option<&str>,
    ) -> Result<Vec<DeviceRegistration>> {
        let devices = self.directory.find_by_user(user_id, application).await?;
        Ok(devices.into_iter().filter(|d| d.is_active()).collect())
    }

    /// Like [`find_active_by_user`](Self::find_active_by_user) but an empty
    /// result is an error.
    pub async fn find_eligible_by_user(
        &self,
        user_id: &str,
        application: Option<&str>,
    ) -> Result<Vec<DeviceRegistration>> {
        let devices = self.find_active_by_user(user_id, application).await?;
        if devices.is_empty() {
            return Err(U2fError::NoEligibleDevices(format!(
                "User {} has no active U2F devices",
                user_id
            )));
        }
        Ok(devices)
    }

    pub async fn find_by_key_handle(
        &self,
        application: &str,
        key_handle: &str,
    ) -> Result<Option<DeviceRegistration>> {
        Ok(self
            .directory
            .find_by_key_handle(application, key_handle)
            .await?)
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<DeviceRegistration>> {
        Ok(self.directory.find_by_id(id).await?)
    }

    /// Record `new_counter` for `device`. A counter that does not strictly
    /// increase marks the device compromised.
    pub async fn apply_counter(
        &self,
        device: &DeviceRegistration,
        new_counter: u32,
    ) -> Result<DeviceRegistration> {
        let now = Utc::now();
        match self
            .directory
            .advance_counter(&device.id, new_counter, now)
            .await?
        {
            CounterUpdate::Advanced => {
                let mut updated = device.clone();
                updated.counter = Some(new_counter);
                updated.last_access_time = Some(now);
                Ok(updated)
            }
            CounterUpdate::Rejected => {
                self.directory.mark_compromised(&device.id).await?;
                tracing::error!(
                    device_id = %device.id,
                    stored_counter = ?device.counter,
                    received_counter = new_counter,
                    "Counter did not increase, device marked compromised"
                );

                let compromised = self
                    .directory
                    .find_by_id(&device.id)
                    .await?
                    .unwrap_or_else(|| device.clone());
                Err(U2fError::DeviceCompromised(Box::new(compromised)))
            }
        }
    }

    /// Idempotent transition to compromised.
    pub async fn disable(&self, device: &DeviceRegistration) -> Result<()> {
        if self.directory.mark_compromised(&device.id).await? {
            tracing::warn!(device_id = %device.id, "Device disabled");
        }
        Ok(())
    }

    pub async fn enroll(&self, device: DeviceRegistration) -> Result<DeviceRegistration> {
        if !self.directory.insert(device.clone()).await? {
            return Err(U2fError::bad_input(format!(
                "Key handle is already registered for {}",
                device.application
            )));
        }
        tracing::info!(
            device_id = %device.id,
            application = %device.application,
            user_id = device.user_id.as_deref().unwrap_or("-"),
            "Device enrolled"
        );
        Ok(device)
    }

    /// Make a provisional enrollment permanent.
    pub async fn confirm(&self, device_id: &str) -> Result<()> {
        if !self.directory.clear_expiration(device_id).await? {
            return Err(U2fError::bad_input(format!("Unknown device {}", device_id)));
        }
        Ok(())
    }

    /// Bind an unowned one-step enrollment to `user_id`.
    pub async fn attach(&self, user_id: &str, device_id: &str) -> Result<()> {
        if !self.directory.attach_user(device_id, user_id).await? {
            return Err(U2fError::bad_input(format!(
                "Device {} is unknown or already attached",
                device_id
            )));
        }
        tracing::info!(device_id = %device_id, user_id = %user_id, "Device attached to user");
        Ok(())
    }

    pub async fn remove_expired(&self) -> Result<usize> {
        Ok(self.directory.remove_expired(Utc::now()).await?)
    }

    pub async fn check_health(&self) -> Result<()> {
        Ok(self.directory.check_health().await?)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStatus;
    use crate::store::MemoryDirectory;

    const APP: &str = "https://app.example";

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(MemoryDirectory::new()))
    }

    fn device(user: &str, key_handle: &str) -> DeviceRegistration {
        DeviceRegistration::new(APP, key_handle, vec![4; 65], vec![0x30])
            .with_user(user)
            .with_counter(10)
    }

    #[tokio::test]
    async fn test_eligible_excludes_compromised() {
        let registry = registry();
        let good = registry.enroll(device("alice", "kh1")).await.unwrap();
        let bad = registry.enroll(device("alice", "kh2")).await.unwrap();
        registry.disable(&bad).await.unwrap();

        let eligible = registry.find_eligible_by_user("alice", Some(APP)).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, good.id);
    }

    #[tokio::test]
    async fn test_no_eligible_devices() {
        let registry = registry();
        let only = registry.enroll(device("alice", "kh1")).await.unwrap();
        registry.disable(&only).await.unwrap();

        let err = registry
            .find_eligible_by_user("alice", None)
            .await
            .unwrap_err();
        assert!(matches!(err, U2fError::NoEligibleDevices(_)));
    }

    #[tokio::test]
    async fn test_apply_counter_advances() {
        let registry = registry();
        let d = registry.enroll(device("alice", "kh1")).await.unwrap();

        let updated = registry.apply_counter(&d, 11).await.unwrap();
        assert_eq!(updated.counter, Some(11));
        assert!(updated.last_access_time.is_some());

        let stored = registry.find_by_id(&d.id).await.unwrap().unwrap();
        assert_eq!(stored.counter, Some(11));
    }

    #[tokio::test]
    async fn test_apply_counter_replay_compromises_device() {
        let registry = registry();
        let d = registry.enroll(device("alice", "kh1")).await.unwrap();

        let err = registry.apply_counter(&d, 10).await.unwrap_err();
        match err {
            U2fError::DeviceCompromised(device) => {
                assert_eq!(device.id, d.id);
                assert_eq!(device.status, DeviceStatus::Compromised);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Even a larger counter is refused once compromised.
        assert!(registry.apply_counter(&d, 50).await.is_err());
        assert!(registry
            .find_active_by_user("alice", None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let registry = registry();
        let d = registry.enroll(device("alice", "kh1")).await.unwrap();
        registry.disable(&d).await.unwrap();
        registry.disable(&d).await.unwrap();

        let stored = registry.find_by_id(&d.id).await.unwrap().unwrap();
        assert!(stored.is_compromised());
    }

    #[tokio::test]
    async fn test_enroll_duplicate_is_bad_input() {
        let registry = registry();
        registry.enroll(device("alice", "kh1")).await.unwrap();
        let err = registry.enroll(device("bob", "kh1")).await.unwrap_err();
        assert!(matches!(err, U2fError::BadInput(_)));
    }

    #[tokio::test]
    async fn test_confirm_and_attach() {
        let registry = registry();
        let d = registry
            .enroll(
                DeviceRegistration::new(APP, "kh1", vec![4; 65], vec![])
                    .with_expiration(chrono::Duration::seconds(60)),
            )
            .await
            .unwrap();

        registry.confirm(&d.id).await.unwrap();
        registry.attach("alice", &d.id).await.unwrap();
        assert!(registry.attach("bob", &d.id).await.is_err());
        assert!(registry.confirm("missing").await.is_err());

        let stored = registry.find_by_id(&d.id).await.unwrap().unwrap();
        assert!(stored.expiration_date.is_none());
        assert!(stored.belongs_to("alice"));
    }
}
