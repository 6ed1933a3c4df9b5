//! Store contracts and in-memory implementations.
//!
//! The pipeline needs an atomic read-modify-write per device. Stores only
//! promise atomic `get`/`upsert` of a single record; [`DeviceLocks`] serializes
//! the classify-then-upsert sequence for one device while leaving different
//! devices fully independent.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::{DevicePosition, Region, Result, TrackerError};

/// Keyed storage of the last-known record per device.
pub trait DeviceStore: Send + Sync {
    /// Record for `device_id` (already normalized), if the device was ever seen.
    fn get(&self, device_id: &str) -> Result<Option<DevicePosition>>;

    /// Insert or replace the record keyed by `record.device_id`.
    fn upsert(&self, record: &DevicePosition) -> Result<()>;
}

/// Storage of user-named regions.
pub trait RegionStore: Send + Sync {
    fn list(&self) -> Result<Vec<Region>>;

    /// Create, or overwrite the region with the same name.
    fn save(&self, region: &Region) -> Result<()>;
}

fn poisoned<T>(_: PoisonError<T>) -> TrackerError {
    TrackerError::Store("store lock poisoned".to_string())
}

/// Device store backed by a `HashMap` behind a read-write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, DevicePosition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceStore for MemoryStore {
    fn get(&self, device_id: &str) -> Result<Option<DevicePosition>> {
        let devices = self.devices.read().map_err(poisoned)?;
        Ok(devices.get(device_id).cloned())
    }

    fn upsert(&self, record: &DevicePosition) -> Result<()> {
        let mut devices = self.devices.write().map_err(poisoned)?;
        devices.insert(record.device_id.clone(), record.clone());
        Ok(())
    }
}

/// Region store keyed by name.
#[derive(Debug, Default)]
pub struct MemoryRegionStore {
    regions: RwLock<BTreeMap<String, Region>>,
}

impl MemoryRegionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegionStore for MemoryRegionStore {
    fn list(&self) -> Result<Vec<Region>> {
        let regions = self.regions.read().map_err(poisoned)?;
        Ok(regions.values().cloned().collect())
    }

    fn save(&self, region: &Region) -> Result<()> {
        let mut regions = self.regions.write().map_err(poisoned)?;
        regions.insert(region.name.clone(), region.clone());
        Ok(())
    }
}

/// One mutex per device id, created on first use.
///
/// The guarded value is `()`, so a poisoned lock carries no broken state and is
/// simply taken over.
///
/// Entries are never evicted. The map holds one mutex per device id ever
/// ingested, so it is bounded by the device count, not by traffic.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of device ids with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` while holding the lock for `device_id`.
    pub fn with_lock<T>(&self, device_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(device_id.to_string()).or_default())
        };
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}
