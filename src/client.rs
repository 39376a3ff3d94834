//! The integrator-facing `Client` facade (§2 "Client facade"): glues the
//! worker layer, hub controller and session manager together, enforces input
//! validation, and mediates sync/async variants of every device operation.
//!
//! Grounded on `cc_lib/client/_client.py`'s `Client` class, in particular its
//! singleton construction (one connector per process) and its paired
//! sync/async methods (`addDevice`/`addDeviceAsync`, etc.) that both bottom
//! out in the same `HubController`/`SessionManager` calls.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;

use crate::auth::AuthProvider;
use crate::cloud::hub::HubController;
use crate::config::ConnectorConfig;
use crate::device::{Device, DeviceRegistry};
use crate::error::{CommandQueueEmptyError, ConnectError, DeviceError, DeviceSessionError, HubError, MessagingError};
use crate::message::{CommandEnvelope, EventEnvelope};
use crate::session::SessionManager;
use crate::util;
use crate::worker::thread::spawn_thread_worker;
use crate::worker::Future;

static INSTANCE: OnceLock<Arc<Client>> = OnceLock::new();

/// The single connector instance for this process (§9 "Singleton").
///
/// A second call to [`Client::new`] does not rebuild the connector; it logs a
/// warning and hands back the instance created by the first call, mirroring
/// the original's metaclass-enforced singleton without needing one.
pub struct Client {
    hub: Arc<HubController>,
    session: Arc<SessionManager>,
    devices: DeviceRegistry,
    id_prefix: String,
}

impl Client {
    pub fn new(config: ConnectorConfig, auth: Box<dyn AuthProvider>) -> anyhow::Result<Arc<Client>> {
        if let Some(existing) = INSTANCE.get() {
            log::warn!("client already instantiated - returning the existing instance");
            return Ok(Arc::clone(existing));
        }
        let client = Arc::new(Self::build(config, auth)?);
        Ok(Arc::clone(INSTANCE.get_or_init(|| client)))
    }

    fn build(config: ConnectorConfig, auth: Box<dyn AuthProvider>) -> anyhow::Result<Client> {
        let id_prefix = config
            .device
            .id_prefix
            .clone()
            .unwrap_or_else(|| util::generate_device_id_prefix(&config.credentials.user));

        let hub = Arc::new(
            HubController::new(&config.api, auth, config.hub.id.clone(), config.hub.name.clone(), id_prefix.clone())
                .context("constructing hub controller")?,
        );
        let session = SessionManager::new(config.connector.clone(), &config.credentials, Arc::clone(&hub), id_prefix.clone());

        Ok(Client { hub, session, devices: DeviceRegistry::new(), id_prefix })
    }

    /// The on-wire device ID prefix in effect for this process. Generated
    /// once if not present in configuration (§3 DeviceIdPrefix); the
    /// integrator is expected to persist it for subsequent runs.
    pub fn id_prefix(&self) -> &str {
        &self.id_prefix
    }

    pub fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        self.session.connect()
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn set_connect_clbk(&self, callback: Option<Arc<dyn Fn() + Send + Sync>>) {
        self.session.set_connect_callback(callback);
    }

    pub fn set_disconnect_clbk(&self, callback: Option<Arc<dyn Fn(i32) + Send + Sync>>) {
        self.session.set_disconnect_callback(callback);
    }

    pub fn init_hub(&self) -> Result<(), HubError> {
        self.hub.init_hub()
    }

    /// Reconciles the remote hub against the currently registered device set
    /// (§4.2). Excludes concurrent `add_device`/`delete_device` for its
    /// duration (§5).
    pub fn sync_hub(&self) -> Result<(), HubError> {
        let devices = self.devices.all();
        self.hub.sync_hub(&devices)
    }

    pub fn connect_device(&self, local_id: &str) -> Result<(), DeviceSessionError> {
        self.session.connect_device(local_id)
    }

    pub fn disconnect_device(&self, local_id: &str) -> Result<(), DeviceSessionError> {
        self.session.disconnect_device(local_id)
    }

    pub fn send_response(&self, envelope: &CommandEnvelope) -> Result<(), MessagingError> {
        self.session.send_response(envelope)
    }

    pub fn emit_event(&self, envelope: &EventEnvelope) -> Result<(), MessagingError> {
        self.session.send_event(envelope)
    }

    pub fn receive_command(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<CommandEnvelope, CommandQueueEmptyError> {
        self.session.receive_command(block, timeout)
    }

    pub fn add_device(&self, mut device: Device) -> Result<Device, DeviceError> {
        self.hub.add_device(&mut device)?;
        self.devices.insert(device.clone());
        Ok(device)
    }

    pub fn add_device_async(self: &Arc<Self>, mut device: Device) -> Future<Device> {
        let this = Arc::clone(self);
        let future = spawn_thread_worker("add-device", move || {
            this.hub.add_device(&mut device)?;
            this.devices.insert(device.clone());
            Ok(device)
        });
        let joinable = future.clone();
        self.hub.register_pending(move || joinable.wait(None));
        future
    }

    pub fn update_device(&self, device: Device) -> Result<Device, DeviceError> {
        self.hub.update_device(&device)?;
        self.devices.insert(device.clone());
        Ok(device)
    }

    pub fn update_device_async(self: &Arc<Self>, device: Device) -> Future<Device> {
        let this = Arc::clone(self);
        let future = spawn_thread_worker("update-device", move || {
            this.hub.update_device(&device)?;
            this.devices.insert(device.clone());
            Ok(device)
        });
        let joinable = future.clone();
        self.hub.register_pending(move || joinable.wait(None));
        future
    }

    pub fn delete_device(&self, local_id: &str) -> Result<(), DeviceError> {
        self.hub.delete_device(local_id)?;
        self.devices.remove(local_id);
        Ok(())
    }

    pub fn delete_device_async(self: &Arc<Self>, local_id: impl Into<String>) -> Future<()> {
        let local_id = local_id.into();
        let this = Arc::clone(self);
        let future = spawn_thread_worker("delete-device", move || {
            this.hub.delete_device(&local_id)?;
            this.devices.remove(&local_id);
            Ok(())
        });
        let joinable = future.clone();
        self.hub.register_pending(move || joinable.wait(None));
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::config::{ApiConfig, AuthEndpointConfig, CredentialsConfig, MqttConfig, Qos};

    fn test_config() -> ConnectorConfig {
        ConnectorConfig {
            auth: AuthEndpointConfig { tls: false, host: "auth.example.com".into(), path: "realms/devices".into(), id: "client-id".into() },
            credentials: CredentialsConfig { user: "alice".into(), pw: "secret".into() },
            api: ApiConfig {
                tls: false,
                host: "api.example.com".into(),
                hub_endpt: "hubs".into(),
                device_endpt: "devices".into(),
                request_timeout_secs: 5,
                eventual_consistency_delay_secs: 0,
            },
            hub: Default::default(),
            device: Default::default(),
            connector: MqttConfig {
                host: "localhost".into(),
                port: 1883,
                tls: false,
                msg_retry_secs: 20,
                keepalive_secs: 30,
                loop_time_ms: 10,
                qos: Qos::Normal,
                reconn_delay_min_secs: 10,
                reconn_delay_max_secs: 300,
                reconn_delay_factor: 1.7,
            },
            logger: Default::default(),
        }
    }

    #[test]
    fn instantiating_twice_returns_same_instance() {
        let first = Client::new(test_config(), Box::new(StaticToken::new("tok"))).unwrap();
        let second = Client::new(test_config(), Box::new(StaticToken::new("tok2"))).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn generated_id_prefix_is_exposed_for_persistence() {
        let client = Client::new(test_config(), Box::new(StaticToken::new("tok"))).unwrap();
        assert!(!client.id_prefix().is_empty());
    }
}
