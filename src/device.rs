//! The [`Device`] descriptor and the process-local [`DeviceRegistry`].
//!
//! Grounded on `cc_lib/types/_device.py`'s mangled-attribute, set-once
//! `remote_id` property (§9 Design Notes: "Name-mangled private attributes
//! for `remote_id`").

use std::collections::HashMap;
use std::sync::Mutex;

use indexmap::IndexMap;

/// A device managed by the integrator and mirrored on the platform.
///
/// `local_id` is immutable once constructed; `remote_id` may be set exactly
/// once, normally as a side effect of [`crate::cloud::hub::HubController::add_device`]
/// or [`crate::cloud::hub::HubController::update_device`].
#[derive(Debug, Clone)]
pub struct Device {
    local_id: String,
    remote_id: Option<String>,
    name: String,
    device_type_id: String,
    tags: IndexMap<String, String>,
}

/// Raised when code attempts to overwrite a `remote_id` that has already been set.
#[derive(Debug, thiserror::Error)]
#[error("remote_id of device '{0}' has already been set")]
pub struct RemoteIdAlreadySetError(pub String);

impl Device {
    /// Creates a new device descriptor. `local_id` must not be empty.
    ///
    /// # Panics
    /// Panics if `local_id` is empty; this is a programmer error at the call
    /// site (construction happens entirely on the integrator's side, never
    /// from untrusted input).
    pub fn new(local_id: impl Into<String>, name: impl Into<String>, device_type_id: impl Into<String>) -> Self {
        let local_id = local_id.into();
        assert!(!local_id.is_empty(), "device local_id must not be empty");
        Device {
            local_id,
            remote_id: None,
            name: name.into(),
            device_type_id: device_type_id.into(),
            tags: IndexMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: IndexMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn device_type_id(&self) -> &str {
        &self.device_type_id
    }

    pub fn tags(&self) -> &IndexMap<String, String> {
        &self.tags
    }

    /// Sets `remote_id` once. Subsequent calls fail without mutating the device.
    pub fn set_remote_id(&mut self, remote_id: impl Into<String>) -> Result<(), RemoteIdAlreadySetError> {
        if self.remote_id.is_some() {
            return Err(RemoteIdAlreadySetError(self.local_id.clone()));
        }
        self.remote_id = Some(remote_id.into());
        Ok(())
    }
}

/// Process-local mapping from local device ID to its descriptor.
///
/// Guarded by a mutex per §5 Locking discipline ("`device_registry_lock`
/// guards the local device pool; held only for O(1) mapping operations").
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, device: Device) {
        let mut devices = self.devices.lock().expect("device registry mutex poisoned");
        devices.insert(device.local_id().to_string(), device);
    }

    pub fn remove(&self, local_id: &str) -> Option<Device> {
        let mut devices = self.devices.lock().expect("device registry mutex poisoned");
        devices.remove(local_id)
    }

    pub fn get(&self, local_id: &str) -> Option<Device> {
        let devices = self.devices.lock().expect("device registry mutex poisoned");
        devices.get(local_id).cloned()
    }

    pub fn update_remote_id(&self, local_id: &str, remote_id: impl Into<String>) -> Result<(), RemoteIdAlreadySetError> {
        let mut devices = self.devices.lock().expect("device registry mutex poisoned");
        if let Some(device) = devices.get_mut(local_id) {
            device.set_remote_id(remote_id)?;
        }
        Ok(())
    }

    pub fn all(&self) -> Vec<Device> {
        let devices = self.devices.lock().expect("device registry mutex poisoned");
        devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().expect("device registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_id_can_only_be_set_once() {
        let mut device = Device::new("d1", "Lamp", "type-a");
        device.set_remote_id("r1").unwrap();
        let err = device.set_remote_id("r2").unwrap_err();
        assert_eq!(err.0, "d1");
        assert_eq!(device.remote_id(), Some("r1"));
    }

    #[test]
    fn registry_round_trips_devices() {
        let registry = DeviceRegistry::new();
        registry.insert(Device::new("d1", "Lamp", "type-a"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("d1").unwrap().name(), "Lamp");
        registry.update_remote_id("d1", "r1").unwrap();
        assert_eq!(registry.get("d1").unwrap().remote_id(), Some("r1"));
        registry.remove("d1");
        assert!(registry.is_empty());
    }
}
