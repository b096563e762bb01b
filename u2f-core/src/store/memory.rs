//! In-memory device and ceremony storage
//!
//! Backed by `DashMap`. Suitable for development and tests; nothing survives
//! a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    CeremonyDirectory, CeremonyRecord, CounterUpdate, DeviceDirectory, StorageError,
};
use crate::device::{key_handle_hash_code, DeviceRegistration, DeviceStatus};

/// Lock order: `key_handle_index` before `devices`.
#[derive(Default)]
pub struct MemoryDirectory {
    devices: DashMap<String, DeviceRegistration>,
    /// key handle hash code -> device ids
    key_handle_index: DashMap<i32, Vec<String>>,
    /// request id -> record
    ceremonies: DashMap<String, CeremonyRecord>,
    /// challenge -> request id
    challenge_index: DashMap<String, String>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn release_challenges(&self, challenges: &[String], request_id: &str) {
        for challenge in challenges {
            self.challenge_index
                .remove_if(challenge, |_, owner| owner == request_id);
        }
    }

    fn unindex_device(&self, device: &DeviceRegistration) {
        if let Entry::Occupied(mut ids) = self.key_handle_index.entry(device.key_handle_hash_code)
        {
            ids.get_mut().retain(|id| id != &device.id);
            if ids.get().is_empty() {
                ids.remove();
            }
        }
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn insert(&self, device: DeviceRegistration) -> Result<bool, StorageError> {
        let mut ids = self
            .key_handle_index
            .entry(device.key_handle_hash_code)
            .or_default();

        let duplicate = ids.iter().any(|id| {
            self.devices.get(id).is_some_and(|existing| {
                existing.application == device.application
                    && existing.key_handle == device.key_handle
            })
        });
        if duplicate {
            return Ok(false);
        }

        ids.push(device.id.clone());
        self.devices.insert(device.id.clone(), device);
        Ok(true)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<DeviceRegistration>, StorageError> {
        Ok(self.devices.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_by_user(
        &self,
        user_id: &str,
        application: Option<&str>,
    ) -> Result<Vec<DeviceRegistration>, StorageError> {
        Ok(self
            .devices
            .iter()
            .filter(|entry| entry.belongs_to(user_id))
            .filter(|entry| application.map_or(true, |app| entry.application == app))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_by_key_handle(
        &self,
        application: &str,
        key_handle: &str,
    ) -> Result<Option<DeviceRegistration>, StorageError> {
        let candidates = match self.key_handle_index.get(&key_handle_hash_code(key_handle)) {
            Some(ids) => ids.clone(),
            None => return Ok(None),
        };

        Ok(candidates.iter().find_map(|id| {
            self.devices
                .get(id)
                .filter(|device| {
                    device.application == application && device.key_handle == key_handle
                })
                .map(|device| device.value().clone())
        }))
    }

    async fn advance_counter(
        &self,
        id: &str,
        counter: u32,
        accessed_at: DateTime<Utc>,
    ) -> Result<CounterUpdate, StorageError> {
        let mut device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("device {}", id)))?;

        let regressed = device.counter.is_some_and(|seen| counter <= seen);
        if device.status != DeviceStatus::Active || regressed {
            return Ok(CounterUpdate::Rejected);
        }

        device.counter = Some(counter);
        device.last_access_time = Some(accessed_at);
        Ok(CounterUpdate::Advanced)
    }

    async fn mark_compromised(&self, id: &str) -> Result<bool, StorageError> {
        let Some(mut device) = self.devices.get_mut(id) else {
            return Ok(false);
        };
        if device.status == DeviceStatus::Compromised {
            return Ok(false);
        }
        device.status = DeviceStatus::Compromised;
        Ok(true)
    }

    async fn clear_expiration(&self, id: &str) -> Result<bool, StorageError> {
        match self.devices.get_mut(id) {
            Some(mut device) => {
                device.clear_expiration();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attach_user(&self, id: &str, user_id: &str) -> Result<bool, StorageError> {
        let Some(mut device) = self.devices.get_mut(id) else {
            return Ok(false);
        };
        if device.user_id.is_some() {
            return Ok(false);
        }
        device.user_id = Some(user_id.to_string());
        Ok(true)
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let expired: Vec<String> = self
            .devices
            .iter()
            .filter(|entry| entry.deletable && entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, device)) = self
                .devices
                .remove_if(&id, |_, device| device.deletable && device.is_expired(now))
            {
                self.unindex_device(&device);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl CeremonyDirectory for MemoryDirectory {
    async fn insert(&self, record: CeremonyRecord) -> Result<bool, StorageError> {
        let challenges = record.payload.challenges();
        let mut reserved: Vec<String> = Vec::with_capacity(challenges.len());

        for challenge in &challenges {
            let claimed = match self.challenge_index.entry(challenge.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(record.request_id.clone());
                    true
                }
            };
            if !claimed {
                self.release_challenges(&reserved, &record.request_id);
                return Ok(false);
            }
            reserved.push(challenge.clone());
        }

        let request_id = record.request_id.clone();
        let inserted = match self.ceremonies.entry(request_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        };
        if !inserted {
            self.release_challenges(&reserved, &request_id);
        }
        Ok(inserted)
    }

    async fn take_by_challenge(
        &self,
        challenge: &str,
    ) -> Result<Option<CeremonyRecord>, StorageError> {
        let Some(request_id) = self
            .challenge_index
            .get(challenge)
            .map(|owner| owner.value().clone())
        else {
            return Ok(None);
        };

        // Only one caller gets the record out of the map.
        let Some((_, record)) = self.ceremonies.remove(&request_id) else {
            return Ok(None);
        };
        self.release_challenges(&record.payload.challenges(), &request_id);

        if record.is_expired(Utc::now()) {
            tracing::debug!(request_id = %request_id, "Discarded expired ceremony");
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let expired: Vec<String> = self
            .ceremonies
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for request_id in expired {
            if let Some((_, record)) = self
                .ceremonies
                .remove_if(&request_id, |_, record| record.is_expired(now))
            {
                self.release_challenges(&record.payload.challenges(), &request_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.ceremonies.len())
    }
}

impl std::fmt::Debug for MemoryDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDirectory")
            .field("devices", &self.devices.len())
            .field("ceremonies", &self.ceremonies.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AuthenticateRequest, AuthenticateRequestMessage};
    use crate::store::CeremonyPayload;
    use chrono::Duration;
    use std::sync::Arc;

    fn device(key_handle: &str) -> DeviceRegistration {
        DeviceRegistration::new("https://app.example", key_handle, vec![4; 65], vec![0x30])
            .with_user("user-1")
            .with_counter(5)
    }

    fn ceremony(challenges: &[&str], ttl: Duration) -> CeremonyRecord {
        let now = Utc::now();
        let message = AuthenticateRequestMessage {
            authenticate_requests: challenges
                .iter()
                .enumerate()
                .map(|(i, c)| AuthenticateRequest::new(c.to_string(), "app", format!("kh{}", i)))
                .collect(),
        };
        CeremonyRecord {
            request_id: challenges[0].to_string(),
            session_id: None,
            user_id: Some("user-1".to_string()),
            creation_date: now,
            expiration_date: now + ttl,
            payload: CeremonyPayload::Authentication(message),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_key_handle() {
        let dir = MemoryDirectory::new();
        assert!(DeviceDirectory::insert(&dir, device("kh")).await.unwrap());
        assert!(!DeviceDirectory::insert(&dir, device("kh")).await.unwrap());
        assert_eq!(dir.device_count(), 1);

        let found = dir
            .find_by_key_handle("https://app.example", "kh")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.user_id.as_deref(), Some("user-1"));
        assert!(dir
            .find_by_key_handle("https://other.example", "kh")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_by_user_filters_application() {
        let dir = MemoryDirectory::new();
        DeviceDirectory::insert(&dir, device("kh1")).await.unwrap();
        let other = DeviceRegistration::new("https://other.example", "kh2", vec![4; 65], vec![])
            .with_user("user-1");
        DeviceDirectory::insert(&dir, other).await.unwrap();

        assert_eq!(dir.find_by_user("user-1", None).await.unwrap().len(), 2);
        assert_eq!(
            dir.find_by_user("user-1", Some("https://app.example"))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(dir.find_by_user("user-2", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_advance_counter_is_strictly_increasing() {
        let dir = MemoryDirectory::new();
        let d = device("kh");
        let id = d.id.clone();
        DeviceDirectory::insert(&dir, d).await.unwrap();
        let now = Utc::now();

        assert_eq!(dir.advance_counter(&id, 5, now).await.unwrap(), CounterUpdate::Rejected);
        assert_eq!(dir.advance_counter(&id, 6, now).await.unwrap(), CounterUpdate::Advanced);
        assert_eq!(dir.advance_counter(&id, 6, now).await.unwrap(), CounterUpdate::Rejected);

        let stored = dir.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.counter, Some(6));
        assert_eq!(stored.last_access_time, Some(now));

        assert!(dir.mark_compromised(&id).await.unwrap());
        assert!(!dir.mark_compromised(&id).await.unwrap());
        assert_eq!(dir.advance_counter(&id, 100, now).await.unwrap(), CounterUpdate::Rejected);
    }

    #[tokio::test]
    async fn test_unobserved_counter_accepts_zero_once() {
        let dir = MemoryDirectory::new();
        let d = DeviceRegistration::new("https://app.example", "fresh", vec![4; 65], vec![0x30]);
        let id = d.id.clone();
        DeviceDirectory::insert(&dir, d).await.unwrap();
        let now = Utc::now();

        assert_eq!(dir.advance_counter(&id, 0, now).await.unwrap(), CounterUpdate::Advanced);
        assert_eq!(dir.find_by_id(&id).await.unwrap().unwrap().counter, Some(0));
        assert_eq!(dir.advance_counter(&id, 0, now).await.unwrap(), CounterUpdate::Rejected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_counter_writes_have_one_winner() {
        let dir = Arc::new(MemoryDirectory::new());
        let d = device("kh");
        let id = d.id.clone();
        DeviceDirectory::insert(dir.as_ref(), d).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dir = Arc::clone(&dir);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                dir.advance_counter(&id, 10, Utc::now()).await.unwrap()
            }));
        }

        let mut advanced = 0;
        for handle in handles {
            if handle.await.unwrap() == CounterUpdate::Advanced {
                advanced += 1;
            }
        }
        assert_eq!(advanced, 1);
    }

    #[tokio::test]
    async fn test_attach_only_unowned_devices() {
        let dir = MemoryDirectory::new();
        let unowned = DeviceRegistration::new("app", "kh", vec![4; 65], vec![]);
        let id = unowned.id.clone();
        DeviceDirectory::insert(&dir, unowned).await.unwrap();

        assert!(dir.attach_user(&id, "user-1").await.unwrap());
        assert!(!dir.attach_user(&id, "user-2").await.unwrap());
        assert!(!dir.attach_user("missing", "user-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_expired_devices_keeps_confirmed() {
        let dir = MemoryDirectory::new();
        let provisional = device("kh1").with_expiration(Duration::seconds(10));
        let confirmed = device("kh2").with_expiration(Duration::seconds(10));
        let confirmed_id = confirmed.id.clone();
        DeviceDirectory::insert(&dir, provisional).await.unwrap();
        DeviceDirectory::insert(&dir, confirmed).await.unwrap();
        assert!(dir.clear_expiration(&confirmed_id).await.unwrap());

        let later = Utc::now() + Duration::seconds(20);
        assert_eq!(DeviceDirectory::remove_expired(&dir, later).await.unwrap(), 1);
        assert!(dir
            .find_by_key_handle("https://app.example", "kh1")
            .await
            .unwrap()
            .is_none());
        assert!(dir.find_by_id(&confirmed_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_take_by_any_challenge_consumes_whole_ceremony() {
        let dir = MemoryDirectory::new();
        let record = ceremony(&["c1", "c2"], Duration::seconds(60));
        assert!(CeremonyDirectory::insert(&dir, record).await.unwrap());

        let taken = dir.take_by_challenge("c2").await.unwrap().unwrap();
        assert_eq!(taken.request_id, "c1");
        assert!(dir.take_by_challenge("c1").await.unwrap().is_none());
        assert!(dir.take_by_challenge("c2").await.unwrap().is_none());
        assert_eq!(dir.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_rejects_overlapping_challenge() {
        let dir = MemoryDirectory::new();
        CeremonyDirectory::insert(&dir, ceremony(&["c1", "c2"], Duration::seconds(60)))
            .await
            .unwrap();
        assert!(
            !CeremonyDirectory::insert(&dir, ceremony(&["c3", "c2"], Duration::seconds(60)))
                .await
                .unwrap()
        );
        // The failed insert must not leave its reservation behind.
        assert!(
            CeremonyDirectory::insert(&dir, ceremony(&["c3"], Duration::seconds(60)))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_expired_ceremony_is_absent() {
        let dir = MemoryDirectory::new();
        CeremonyDirectory::insert(&dir, ceremony(&["old"], Duration::seconds(-1)))
            .await
            .unwrap();
        assert!(dir.take_by_challenge("old").await.unwrap().is_none());
        assert_eq!(dir.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_expired_ceremonies() {
        let dir = MemoryDirectory::new();
        CeremonyDirectory::insert(&dir, ceremony(&["a"], Duration::seconds(-1)))
            .await
            .unwrap();
        CeremonyDirectory::insert(&dir, ceremony(&["b"], Duration::seconds(60)))
            .await
            .unwrap();

        assert_eq!(
            CeremonyDirectory::remove_expired(&dir, Utc::now()).await.unwrap(),
            1
        );
        assert_eq!(dir.count().await.unwrap(), 1);
        assert!(dir.take_by_challenge("b").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_take_has_one_winner() {
        let dir = Arc::new(MemoryDirectory::new());
        CeremonyDirectory::insert(dir.as_ref(), ceremony(&["c1"], Duration::seconds(60)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dir = Arc::clone(&dir);
            handles.push(tokio::spawn(async move {
                dir.take_by_challenge("c1").await.unwrap().is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
