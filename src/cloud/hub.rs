//! Hub initialization, reconciliation, and device lifecycle over HTTP (§4.2).
//!
//! Grounded on `spotflow::cloud::dps::Provisioning` for the "translate HTTP
//! status codes into a small domain error enum" shape, and on
//! `_client.py::initHub/syncHub/addDevice/updateDevice/deleteDevice` for the
//! exact sequencing and status-code handling this module reimplements.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use http::Uri;
use serde::{Deserialize, Serialize};

use crate::auth::AuthProvider;
use crate::cloud::api_core::{ApiClient, RequestError};
use crate::config::ApiConfig;
use crate::device::Device;
use crate::error::{DeviceError, HubError};
use crate::util::{self, ManualResetEvent};

#[derive(Debug, Serialize)]
struct HubCreateRequest<'a> {
    id: Option<&'a str>,
    name: &'a str,
    hash: Option<&'a str>,
    device_local_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HubResponse {
    id: String,
    name: String,
    hash: Option<String>,
    #[serde(default)]
    device_local_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DeviceCreateRequest<'a> {
    name: &'a str,
    device_type_id: &'a str,
    local_id: &'a str,
}

#[derive(Debug, Serialize)]
struct DeviceUpdateRequest<'a> {
    id: &'a str,
    name: &'a str,
    device_type_id: &'a str,
    local_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeviceResponse {
    id: String,
}

struct HubState {
    id: Option<String>,
    name: Option<String>,
    initialized: bool,
}

/// Owns the hub's runtime identity and all HTTP device/hub lifecycle calls.
///
/// Deliberately does not mutate the [`crate::config::HubConfig`] it was
/// constructed from: the hub's runtime `id`/`name` live only in this
/// controller's own state, so that configuration stays an immutable snapshot
/// (a divergence from the original, which rewrote its configuration object
/// in place — see DESIGN.md).
pub struct HubController {
    api: ApiClient,
    auth: Box<dyn AuthProvider>,
    base_uri: Uri,
    hub_endpoint: String,
    device_endpoint: String,
    eventual_consistency_delay: Duration,
    id_prefix: String,
    configured_name: Option<String>,
    state: Mutex<HubState>,
    sync_lock: Mutex<()>,
    sync_event: ManualResetEvent,
    pending: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl HubController {
    pub fn new(
        api_config: &ApiConfig,
        auth: Box<dyn AuthProvider>,
        hub_id: Option<String>,
        hub_name: Option<String>,
        id_prefix: String,
    ) -> anyhow::Result<Self> {
        let scheme = if api_config.tls { "https" } else { "http" };
        let base_uri: Uri = format!("{scheme}://{}", api_config.host)
            .parse()
            .context("parsing configured API host into a URI")?;
        let api = ApiClient::new(Duration::from_secs(api_config.request_timeout_secs))?;

        Ok(HubController {
            api,
            auth,
            base_uri,
            hub_endpoint: api_config.hub_endpt.clone(),
            device_endpoint: api_config.device_endpt.clone(),
            eventual_consistency_delay: Duration::from_secs(api_config.eventual_consistency_delay_secs),
            id_prefix,
            configured_name: hub_name,
            state: Mutex::new(HubState {
                id: hub_id,
                name: None,
                initialized: false,
            }),
            sync_lock: Mutex::new(()),
            sync_event: ManualResetEvent::new(),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().expect("hub state mutex poisoned").initialized
    }

    pub fn hub_id(&self) -> Option<String> {
        self.state.lock().expect("hub state mutex poisoned").id.clone()
    }

    fn token(&self) -> anyhow::Result<String> {
        self.auth
            .get_access_token()
            .map_err(|e| anyhow::Error::new(e))
    }

    fn hub_uri(&self, id: Option<&str>) -> anyhow::Result<Uri> {
        let path = match id {
            Some(id) => format!("/{}/{}", self.hub_endpoint, urlencoding::encode(id)),
            None => format!("/{}", self.hub_endpoint),
        };
        path.parse().context("building hub URI")
    }

    fn device_uri(&self, prefixed_id: Option<&str>) -> anyhow::Result<Uri> {
        let path = match prefixed_id {
            Some(id) => format!("/{}/{}", self.device_endpoint, urlencoding::encode(id)),
            None => format!("/{}", self.device_endpoint),
        };
        path.parse().context("building device URI")
    }

    fn prefixed(&self, local_id: &str) -> String {
        util::prefix_device_id(&self.id_prefix, local_id)
    }

    /// Records a background task (started by an async `add_device`/`delete_device`
    /// dispatch) so that the next `sync_hub` can join it before reading the
    /// device set (§5: "calls started before sync_hub are joined into the sync").
    ///
    /// Takes a blocking wait closure rather than a concrete `Future<T>` so
    /// callers can register dispatches that resolve to different result
    /// types (`Device`, `()`, ...) in the same pending set.
    pub fn register_pending(&self, wait: impl FnOnce() + Send + 'static) {
        self.pending.lock().expect("pending set poisoned").push(Box::new(wait));
    }

    fn join_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().expect("pending set poisoned"));
        for wait in pending {
            wait();
        }
    }

    /// Blocks the caller while a sync is in progress, unless the hub has
    /// never been initialized (nothing to race against yet).
    fn wait_for_sync(&self) {
        if self.is_initialized() {
            self.sync_event.wait();
        }
    }

    pub fn init_hub(&self) -> Result<(), HubError> {
        let token = self.token().map_err(|e| HubError::Initialization(Some(e)))?;
        let existing_id = self.state.lock().expect("hub state mutex poisoned").id.clone();

        match existing_id {
            None => {
                let name = self.configured_name.clone().unwrap_or_else(default_hub_name);
                let uri = self.hub_uri(None).map_err(|e| HubError::Initialization(Some(e)))?;
                let body = HubCreateRequest {
                    id: None,
                    name: &name,
                    hash: None,
                    device_local_ids: Vec::new(),
                };
                let response = self
                    .api
                    .post(&self.base_uri, &uri, &token, &body)
                    .map_err(|e| HubError::Initialization(Some(e.into())))?;
                let parsed: HubResponse = response
                    .into_json()
                    .context("parsing hub creation response")
                    .map_err(|e| HubError::Initialization(Some(e)))?;

                let mut state = self.state.lock().expect("hub state mutex poisoned");
                state.id = Some(parsed.id);
                state.name = Some(parsed.name);
                state.initialized = true;
                Ok(())
            }
            Some(id) => {
                let uri = self.hub_uri(Some(&id)).map_err(|e| HubError::Initialization(Some(e)))?;
                match self.api.head(&self.base_uri, &uri, &token) {
                    Ok(_) => {
                        self.state.lock().expect("hub state mutex poisoned").initialized = true;
                        Ok(())
                    }
                    Err(e) if e.is_not_found() => {
                        self.state.lock().expect("hub state mutex poisoned").id = None;
                        Err(HubError::NotFound)
                    }
                    Err(e) => Err(HubError::Initialization(Some(e.into()))),
                }
            }
        }
    }

    pub fn sync_hub(&self, devices: &[Device]) -> Result<(), HubError> {
        let _guard = self.sync_lock.lock().expect("hub sync lock poisoned");
        self.sync_event.clear();
        let result = self.sync_hub_inner(devices);
        self.sync_event.set();
        result
    }

    fn sync_hub_inner(&self, devices: &[Device]) -> Result<(), HubError> {
        self.join_pending();

        let hub_id = self.hub_id().ok_or(HubError::NotInitialized)?;
        let token = self.token().map_err(|e| HubError::Sync(Some(e)))?;

        let prefixed_ids: Vec<String> = devices.iter().map(|d| self.prefixed(d.local_id())).collect();
        let local_hash = util::hash_devices(devices);

        let uri = self.hub_uri(Some(&hub_id)).map_err(|e| HubError::Sync(Some(e)))?;
        let response = match self.api.get(&self.base_uri, &uri, &token) {
            Ok(response) => response,
            Err(e) if e.is_not_found() => {
                self.state.lock().expect("hub state mutex poisoned").id = None;
                return Err(HubError::NotFound);
            }
            Err(e) => return Err(HubError::Sync(Some(e.into()))),
        };
        let remote: HubResponse = response
            .into_json()
            .context("parsing hub fetch response")
            .map_err(|e| HubError::Sync(Some(e)))?;

        // Remote always wins on a name mismatch (§4.2).
        self.state.lock().expect("hub state mutex poisoned").name = Some(remote.name.clone());

        if remote.hash.as_deref() != Some(local_hash.as_str()) {
            let body = HubCreateRequest {
                id: Some(&hub_id),
                name: &remote.name,
                hash: Some(&local_hash),
                device_local_ids: prefixed_ids,
            };
            match self.api.put(&self.base_uri, &uri, &token, &body) {
                Ok(_) => {}
                Err(RequestError::Status(400, _)) => return Err(HubError::SyncDevice),
                Err(e) if e.is_not_found() => {
                    self.state.lock().expect("hub state mutex poisoned").id = None;
                    return Err(HubError::NotFound);
                }
                Err(e) => return Err(HubError::Sync(Some(e.into()))),
            }
        }

        Ok(())
    }

    pub fn add_device(&self, device: &mut Device) -> Result<(), DeviceError> {
        self.wait_for_sync();
        let token = self
            .token()
            .map_err(|e| DeviceError::Add(device.local_id().to_string(), Some(e)))?;
        let prefixed = self.prefixed(device.local_id());
        let uri = self
            .device_uri(Some(&prefixed))
            .map_err(|e| DeviceError::Add(device.local_id().to_string(), Some(e)))?;

        match self.api.get(&self.base_uri, &uri, &token) {
            Err(e) if e.is_not_found() => {
                let create_uri = self
                    .device_uri(None)
                    .map_err(|e| DeviceError::Add(device.local_id().to_string(), Some(e)))?;
                let body = DeviceCreateRequest {
                    name: device.name(),
                    device_type_id: device.device_type_id(),
                    local_id: device.local_id(),
                };
                let response = self
                    .api
                    .post(&self.base_uri, &create_uri, &token, &body)
                    .map_err(|e| DeviceError::Add(device.local_id().to_string(), Some(e.into())))?;
                let parsed: DeviceResponse = response
                    .into_json()
                    .context("parsing device creation response")
                    .map_err(|e| DeviceError::Add(device.local_id().to_string(), Some(e)))?;
                if let Err(already_set) = device.set_remote_id(parsed.id) {
                    log::warn!("device '{}' already had a remote id set: {already_set}", device.local_id());
                }
                thread::sleep(self.eventual_consistency_delay);
                Ok(())
            }
            Ok(response) => {
                let parsed: DeviceResponse = response
                    .into_json()
                    .context("parsing existing device response")
                    .map_err(|e| DeviceError::Add(device.local_id().to_string(), Some(e)))?;
                if let Err(already_set) = device.set_remote_id(parsed.id) {
                    log::warn!("device '{}' already had a remote id set: {already_set}", device.local_id());
                }
                self.update_device(device).map_err(|e| {
                    DeviceError::Add(device.local_id().to_string(), Some(anyhow::anyhow!(e.to_string())))
                })
            }
            Err(e) => Err(DeviceError::Add(device.local_id().to_string(), Some(e.into()))),
        }
    }

    pub fn update_device(&self, device: &Device) -> Result<(), DeviceError> {
        self.wait_for_sync();
        let remote_id = device
            .remote_id()
            .ok_or_else(|| DeviceError::NotFound(device.local_id().to_string()))?;
        let token = self
            .token()
            .map_err(|e| DeviceError::Update(device.local_id().to_string(), Some(e)))?;
        let prefixed = self.prefixed(device.local_id());
        let uri = self
            .device_uri(Some(&prefixed))
            .map_err(|e| DeviceError::Update(device.local_id().to_string(), Some(e)))?;
        let body = DeviceUpdateRequest {
            id: remote_id,
            name: device.name(),
            device_type_id: device.device_type_id(),
            local_id: device.local_id(),
        };

        match self.api.put(&self.base_uri, &uri, &token, &body) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(DeviceError::NotFound(device.local_id().to_string())),
            Err(e) => Err(DeviceError::Update(device.local_id().to_string(), Some(e.into()))),
        }
    }

    pub fn delete_device(&self, local_id: &str) -> Result<(), DeviceError> {
        self.wait_for_sync();
        let token = self
            .token()
            .map_err(|e| DeviceError::Delete(local_id.to_string(), Some(e)))?;
        let prefixed = self.prefixed(local_id);
        let uri = self
            .device_uri(Some(&prefixed))
            .map_err(|e| DeviceError::Delete(local_id.to_string(), Some(e)))?;

        match self.api.delete(&self.base_uri, &uri, &token) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                log::warn!("device '{local_id}' was already absent from the platform");
                Ok(())
            }
            Err(e) => Err(DeviceError::Delete(local_id.to_string(), Some(e.into()))),
        }
    }
}

fn default_hub_name() -> String {
    let user = whoami::username();
    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S");
    format!("{user}-{now}")
}
