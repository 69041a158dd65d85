//! Device identity resolution and auto-provisioning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::info;

use crate::error::{Result, TelemetryError};
use crate::protocol::{DeviceId, DeviceInfo};
use crate::storage::Storage;

type LocationKey = (String, String);

/// Per-location async locks, so two unknown devices reporting the same
/// location cannot both allocate an identifier for it.
#[derive(Debug, Clone, Default)]
pub struct LocationLocks {
    locks: Arc<Mutex<HashMap<LocationKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LocationLocks {
    /// No locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `info`'s location.
    pub async fn lock(&self, info: &DeviceInfo) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry((info.country.clone(), info.city.clone()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }

    /// Locations currently locked or awaited.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

/// Find the identifier registered for `info`, provisioning one if needed.
pub async fn resolve_location(
    storage: &Storage,
    locks: &LocationLocks,
    info: &DeviceInfo,
) -> Result<DeviceId> {
    let _guard = locks.lock(info).await;

    let existing = storage
        .find_device_by_location(info)
        .await
        .map_err(|e| TelemetryError::Identity(format!("location lookup failed: {e}")))?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = storage
        .register_device(info)
        .await
        .map_err(|e| TelemetryError::Identity(format!("registration failed: {e}")))?;
    info!(device = %id, country = %info.country, city = %info.city, "device provisioned");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_location_resolves_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).await.unwrap();
        let locks = LocationLocks::new();
        let rome = DeviceInfo::new("IT", "Rome");

        let (a, b) = tokio::join!(
            resolve_location(&storage, &locks, &rome),
            resolve_location(&storage, &locks, &rome)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(storage.devices().await.unwrap().len(), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_distinct_locations_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).await.unwrap();
        let locks = LocationLocks::new();

        let rome = resolve_location(&storage, &locks, &DeviceInfo::new("IT", "Rome"))
            .await
            .unwrap();
        let turin = resolve_location(&storage, &locks, &DeviceInfo::new("IT", "Turin"))
            .await
            .unwrap();
        assert_ne!(rome, turin);
    }

    #[tokio::test]
    async fn test_storage_failure_is_identity_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("t.db")).await.unwrap();
        storage.close().await.unwrap();

        let err = resolve_location(&storage, &LocationLocks::new(), &DeviceInfo::new("IT", "Rome"))
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Identity(_)));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let locks = LocationLocks::new();
        let info = DeviceInfo::new("IT", "Rome");

        let guard = locks.lock(&info).await;
        assert_eq!(locks.active(), 1);
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            locks.lock(&info),
        )
        .await;
        assert!(waiting.is_err());

        drop(guard);
        let _again = locks.lock(&info).await;
    }
}
