//! `SessionManager`: the MQTT session state machine (§4.3), reconnect backoff
//! (§4.4), device subscribe/unsubscribe (§4.5), command ingress (§4.6) and
//! response/event egress (§4.7).
//!
//! Grounded on `cc_lib/client/_client.py`'s `__connect`/`__reconnect`/
//! `__onConnect`/`__onDisconnect`/`__connectDevice`/`__disconnectDevice`/
//! `__handleCommand`/`__send` methods, rebuilt around [`crate::mqtt::MqttTransport`]
//! instead of a callback-driven `paho-mqtt` client. MQTT broker credentials
//! come straight from the connector's own `credentials.user`/`credentials.pw`
//! (confirmed from the original: `connect(host, port, usr, pw)` calls
//! `username_pw_set(usr, pw)` with those exact values), not from
//! [`crate::auth::AuthProvider`], which only fronts the HTTP control plane.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::cloud::hub::HubController;
use crate::config::{CredentialsConfig, MqttConfig};
use crate::error::{
    CommandQueueEmptyError, ConnectError, DeviceSessionError, MessagingError, NotConnectedError,
};
use crate::message::{CommandEnvelope, EventEnvelope};
use crate::mqtt::{topics, EventSink, MqttTransport, TransportEvent};
use crate::util;

/// Commands that arrive faster than the integrator drains them are dropped
/// rather than buffered without bound (§4.6: "queue full" is a logged,
/// non-fatal condition, never a reason to block the MQTT poll loop).
const COMMAND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn(i32) + Send + Sync>;

pub struct SessionManager {
    transport: MqttTransport,
    hub: Arc<HubController>,
    host: String,
    port: u16,
    qos: u8,
    reconn_delay_min: u64,
    reconn_delay_max: u64,
    reconn_delay_factor: f64,
    user: String,
    pw: String,
    id_prefix: String,
    connect_lock: Mutex<()>,
    set_callback_lock: Mutex<()>,
    state: Mutex<SessionState>,
    reconnect_flag: AtomicBool,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    command_tx: SyncSender<CommandEnvelope>,
    command_rx: Mutex<Receiver<CommandEnvelope>>,
}

impl SessionManager {
    /// `id_prefix` is shared with [`HubController`] so on-wire device IDs
    /// agree between the HTTP and MQTT surfaces.
    pub fn new(
        mqtt_config: MqttConfig,
        credentials: &CredentialsConfig,
        hub: Arc<HubController>,
        id_prefix: String,
    ) -> Arc<Self> {
        let host = mqtt_config.host.clone();
        let port = mqtt_config.port;
        let qos = mqtt_config.qos.as_u8();
        let reconn_delay_min = mqtt_config.reconn_delay_min_secs;
        let reconn_delay_max = mqtt_config.reconn_delay_max_secs;
        let reconn_delay_factor = mqtt_config.reconn_delay_factor;
        let user = credentials.user.clone();
        let pw = credentials.pw.clone();
        let (command_tx, command_rx) = sync_channel(COMMAND_QUEUE_CAPACITY);

        Arc::new_cyclic(|weak: &Weak<SessionManager>| {
            let weak = weak.clone();
            let sink: EventSink = Arc::new(move |event| {
                if let Some(session) = weak.upgrade() {
                    session.handle_transport_event(event);
                }
            });
            SessionManager {
                transport: MqttTransport::new(mqtt_config, sink),
                hub,
                host,
                port,
                qos,
                reconn_delay_min,
                reconn_delay_max,
                reconn_delay_factor,
                user,
                pw,
                id_prefix,
                connect_lock: Mutex::new(()),
                set_callback_lock: Mutex::new(()),
                state: Mutex::new(SessionState::Disconnected),
                reconnect_flag: AtomicBool::new(false),
                on_connect: Mutex::new(None),
                on_disconnect: Mutex::new(None),
                command_tx,
                command_rx: Mutex::new(command_rx),
            }
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn set_connect_callback(&self, callback: Option<ConnectCallback>) {
        let _guard = self.set_callback_lock.lock().expect("set callback lock poisoned");
        *self.on_connect.lock().expect("connect callback poisoned") = callback;
    }

    pub fn set_disconnect_callback(&self, callback: Option<DisconnectCallback>) {
        let _guard = self.set_callback_lock.lock().expect("set callback lock poisoned");
        *self.on_disconnect.lock().expect("disconnect callback poisoned") = callback;
    }

    /// Opens the session. Serialized by `connect_lock` (§5): a second call
    /// while already connected fails immediately rather than queuing.
    pub fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        let _guard = self.connect_lock.lock().expect("connect lock poisoned");
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if *state == SessionState::Connected {
                log::error!(
                    "connecting to '{}' on '{}' failed - already connected",
                    self.host,
                    self.port
                );
                return Err(ConnectError::AlreadyConnected);
            }
            *state = SessionState::Connecting;
        }
        self.reconnect_flag.store(true, Ordering::SeqCst);
        log::info!("connecting to '{}' on '{}' ...", self.host, self.port);

        match self.attempt_connect() {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.reconnect_flag.load(Ordering::SeqCst) {
                    log::warn!("connecting to '{}' on '{}' failed - {e}", self.host, self.port);
                    *self.state.lock().expect("session state poisoned") = SessionState::Reconnecting;
                    self.spawn_reconnect_loop();
                } else {
                    log::error!("connecting to '{}' on '{}' failed - {e}", self.host, self.port);
                    *self.state.lock().expect("session state poisoned") = SessionState::Disconnected;
                }
                Err(ConnectError::Transport(e))
            }
        }
    }

    /// Closes the session. Sets `reconnect_flag=false` first so a broker-level
    /// drop that races with this call doesn't spin up a reconnect loop.
    pub fn disconnect(&self) {
        self.reconnect_flag.store(false, Ordering::SeqCst);
        if !self.transport.is_connected() {
            *self.state.lock().expect("session state poisoned") = SessionState::Disconnected;
            return;
        }
        *self.state.lock().expect("session state poisoned") = SessionState::ShuttingDown;
        self.transport.disconnect();
    }

    pub fn connect_device(&self, local_id: &str) -> Result<(), DeviceSessionError> {
        if !self.is_connected() {
            log::error!("connecting device '{local_id}' to platform failed - not connected");
            return Err(DeviceSessionError::NotConnected(NotConnectedError));
        }
        log::info!("connecting device '{local_id}' to platform ...");
        let topic = topics::command_filter(&self.prefixed(local_id));
        let future = self.transport.subscribe(&topic, self.qos);
        future.wait(None);
        match future.result().expect("subscribe future is done after wait") {
            Ok(granted) if granted.iter().any(|&code| code == 128) => {
                log::error!("connecting device '{local_id}' to platform failed - not allowed");
                Err(DeviceSessionError::ConnectNotAllowed(local_id.to_string()))
            }
            Ok(_) => {
                log::info!("connecting device '{local_id}' to platform successful");
                Ok(())
            }
            Err(e) => {
                log::error!("connecting device '{local_id}' to platform failed - {e}");
                Err(DeviceSessionError::Connect(local_id.to_string(), Some(e)))
            }
        }
    }

    pub fn disconnect_device(&self, local_id: &str) -> Result<(), DeviceSessionError> {
        if !self.is_connected() {
            log::error!("disconnecting device '{local_id}' from platform failed - not connected");
            return Err(DeviceSessionError::NotConnected(NotConnectedError));
        }
        log::info!("disconnecting device '{local_id}' from platform ...");
        let topic = topics::command_filter(&self.prefixed(local_id));
        let future = self.transport.unsubscribe(&topic);
        future.wait(None);
        match future.result().expect("unsubscribe future is done after wait") {
            Ok(()) => {
                log::info!("disconnecting device '{local_id}' from platform successful");
                Ok(())
            }
            Err(e) => {
                log::error!("disconnecting device '{local_id}' from platform failed - {e}");
                Err(DeviceSessionError::Disconnect(local_id.to_string(), Some(e)))
            }
        }
    }

    pub fn send_response(&self, envelope: &CommandEnvelope) -> Result<(), MessagingError> {
        if !self.is_connected() {
            log::error!(
                "sending response '{}' to platform failed - not connected",
                envelope.correlation_id
            );
            return Err(MessagingError::NotConnected(NotConnectedError));
        }
        log::debug!("sending response '{}' to platform ...", envelope.correlation_id);
        let topic = topics::response_topic(&self.prefixed(&envelope.device_local_id), &envelope.service_uri);
        let payload = serde_json::to_vec(&envelope.to_wire_json()).expect("envelope always serializes");
        let future = self.transport.publish(&topic, payload, self.qos);
        future.wait(None);
        match future.result().expect("publish future is done after wait") {
            Ok(()) => {
                if self.qos > 0 {
                    log::debug!("sending response '{}' to platform successful", envelope.correlation_id);
                }
                Ok(())
            }
            Err(e) => {
                log::error!("sending response '{}' to platform failed - {e}", envelope.correlation_id);
                Err(MessagingError::SendResponse(envelope.correlation_id.clone(), Some(e)))
            }
        }
    }

    pub fn send_event(&self, envelope: &EventEnvelope) -> Result<(), MessagingError> {
        if !self.is_connected() {
            log::error!(
                "sending event '{}' to platform failed - not connected",
                envelope.correlation_id
            );
            return Err(MessagingError::NotConnected(NotConnectedError));
        }
        log::debug!("sending event '{}' to platform ...", envelope.correlation_id);
        let topic = topics::event_topic(&self.prefixed(&envelope.device_local_id), &envelope.service_uri);
        let payload = serde_json::to_vec(&envelope.to_wire_json()).expect("envelope always serializes");
        let future = self.transport.publish(&topic, payload, self.qos);
        future.wait(None);
        match future.result().expect("publish future is done after wait") {
            Ok(()) => {
                if self.qos > 0 {
                    log::debug!("sending event '{}' to platform successful", envelope.correlation_id);
                }
                Ok(())
            }
            Err(e) => {
                log::error!("sending event '{}' to platform failed - {e}", envelope.correlation_id);
                Err(MessagingError::SendEvent(envelope.correlation_id.clone(), Some(e)))
            }
        }
    }

    /// Drains one command from the ingress queue (§4.6). `block=false` and a
    /// `None` timeout both mean "return immediately if nothing is queued".
    pub fn receive_command(
        &self,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<CommandEnvelope, CommandQueueEmptyError> {
        let rx = self.command_rx.lock().expect("command queue poisoned");
        if !block {
            return rx.try_recv().map_err(|_| CommandQueueEmptyError);
        }
        match timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|_| CommandQueueEmptyError),
            None => rx.recv().map_err(|_| CommandQueueEmptyError),
        }
    }

    fn prefixed(&self, local_id: &str) -> String {
        util::prefix_device_id(&self.id_prefix, local_id)
    }

    /// Hub id if the hub has been initialized, otherwise `md5(user)` hex
    /// (§4.3 "Client identifier"). Recomputed on every connect attempt since
    /// the hub can become initialized between an initial failed connect and
    /// a later reconnect.
    fn compute_client_id(&self) -> String {
        if self.hub.is_initialized() {
            if let Some(hub_id) = self.hub.hub_id() {
                return hub_id;
            }
        }
        format!("{:x}", md5::compute(self.user.as_bytes()))
    }

    /// Connects (or reconnects) once and, on success, transitions to
    /// `Connected` and fires the user callback. Shared by [`Self::connect`]
    /// and the reconnect loop.
    fn attempt_connect(&self) -> Result<(), anyhow::Error> {
        let client_id = self.compute_client_id();
        let future = self.transport.connect(&client_id, &self.user, &self.pw);
        future.wait(None);
        future.result().expect("connect future is done after wait").map(|()| {
            *self.state.lock().expect("session state poisoned") = SessionState::Connected;
            log::info!("connecting to '{}' on '{}' successful", self.host, self.port);
            self.dispatch_on_connect();
        })
    }

    fn spawn_reconnect_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("reconnect".to_string())
            .spawn(move || this.reconnect_loop());
        if let Err(e) = spawned {
            log::error!("could not start reconnect loop: {e}");
            *self.state.lock().expect("session state poisoned") = SessionState::Disconnected;
        }
    }

    fn reconnect_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        while self.reconnect_flag.load(Ordering::SeqCst) {
            attempt += 1;
            let duration =
                util::calc_duration(self.reconn_delay_min, self.reconn_delay_max, attempt, self.reconn_delay_factor);
            log_reconnect_delay(duration);
            thread::sleep(Duration::from_secs(duration));
            if !self.reconnect_flag.load(Ordering::SeqCst) {
                break;
            }
            self.transport.reset();
            match self.attempt_connect() {
                Ok(()) => return,
                Err(e) => log::warn!("connecting to '{}' on '{}' failed - {e}", self.host, self.port),
            }
        }
        *self.state.lock().expect("session state poisoned") = SessionState::Disconnected;
    }

    fn dispatch_on_connect(&self) {
        let callback = self.on_connect.lock().expect("connect callback poisoned").clone();
        if let Some(callback) = callback {
            let _ = thread::Builder::new()
                .name("user-connect-callback".to_string())
                .spawn(move || callback());
        }
    }

    fn dispatch_on_disconnect(&self, code: i32) {
        let callback = self.on_disconnect.lock().expect("disconnect callback poisoned").clone();
        if let Some(callback) = callback {
            let _ = thread::Builder::new()
                .name("user-disconnect-callback".to_string())
                .spawn(move || callback(code));
        }
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            // Handled inline by `attempt_connect` right after `Future::wait`
            // returns; see the worker-layer `usr_method` deviation note in
            // `crate::worker` for why no separate hook is needed here either.
            TransportEvent::Connected => {}
            TransportEvent::Disconnected { code } => self.on_transport_disconnected(code),
            TransportEvent::Command { prefixed_device_id, service_uri, payload } => {
                self.handle_command(prefixed_device_id, service_uri, payload)
            }
        }
    }

    fn on_transport_disconnected(self: &Arc<Self>, code: i32) {
        let reconnect = self.reconnect_flag.load(Ordering::SeqCst);
        if code > 0 {
            if reconnect {
                log::warn!("unexpected disconnect - code {code}");
            } else {
                log::error!("unexpected disconnect - code {code}");
            }
        } else {
            log::info!("disconnected by user");
        }
        self.dispatch_on_disconnect(code);
        if reconnect {
            *self.state.lock().expect("session state poisoned") = SessionState::Reconnecting;
            self.spawn_reconnect_loop();
        } else {
            *self.state.lock().expect("session state poisoned") = SessionState::Disconnected;
        }
    }

    fn handle_command(&self, prefixed_device_id: String, service_uri: String, payload: Vec<u8>) {
        log::debug!("received command ... service uri: '{service_uri}'");
        let local_id = util::parse_device_id(&self.id_prefix, &prefixed_device_id);
        match CommandEnvelope::from_wire(local_id, service_uri.clone(), &payload) {
            Ok(envelope) => match self.command_tx.try_send(envelope) {
                Ok(()) => {}
                Err(_) => log::error!("could not route command to user - queue full - service uri '{service_uri}'"),
            },
            Err(e) => log::error!("could not parse command - {e} - service uri '{service_uri}'"),
        }
    }
}

fn log_reconnect_delay(duration: u64) {
    let minutes = duration / 60;
    let seconds = duration % 60;
    match (minutes, seconds) {
        (0, s) => log::info!("reconnect in {s}s ..."),
        (m, 0) => log::info!("reconnect in {m}m ..."),
        (m, s) => log::info!("reconnect in {m}m and {s}s ..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::config::{ApiConfig, CredentialsConfig, MqttConfig, Qos};
    use crate::message::Message;

    fn test_mqtt_config() -> MqttConfig {
        MqttConfig {
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
        }
    }

    fn test_hub() -> Arc<HubController> {
        let api_config = ApiConfig {
            tls: false,
            host: "api.example.com".into(),
            hub_endpt: "hubs".into(),
            device_endpt: "devices".into(),
            request_timeout_secs: 5,
            eventual_consistency_delay_secs: 0,
        };
        Arc::new(
            HubController::new(&api_config, Box::new(StaticToken::new("tok")), None, None, "P".into())
                .unwrap(),
        )
    }

    fn test_session() -> Arc<SessionManager> {
        let credentials = CredentialsConfig { user: "alice".into(), pw: "secret".into() };
        SessionManager::new(test_mqtt_config(), &credentials, test_hub(), "P".into())
    }

    #[test]
    fn client_id_falls_back_to_user_hash_when_hub_uninitialized() {
        let session = test_session();
        let expected = format!("{:x}", md5::compute(b"alice"));
        assert_eq!(session.compute_client_id(), expected);
    }

    #[test]
    fn second_connect_while_connected_is_rejected() {
        let session = test_session();
        *session.state.lock().unwrap() = SessionState::Connected;
        let err = session.connect().unwrap_err();
        assert!(matches!(err, ConnectError::AlreadyConnected));
    }

    #[test]
    fn disconnecting_without_ever_connecting_is_a_no_op() {
        let session = test_session();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn connect_device_fails_fast_when_not_connected() {
        let session = test_session();
        let err = session.connect_device("d1").unwrap_err();
        assert!(matches!(err, DeviceSessionError::NotConnected(_)));
    }

    #[test]
    fn disconnect_device_fails_fast_when_not_connected() {
        let session = test_session();
        let err = session.disconnect_device("d1").unwrap_err();
        assert!(matches!(err, DeviceSessionError::NotConnected(_)));
    }

    #[test]
    fn sending_event_while_not_connected_fails_fast() {
        let session = test_session();
        let envelope = EventEnvelope::new("d1", "srvX", Message::default());
        let err = session.send_event(&envelope).unwrap_err();
        assert!(matches!(err, MessagingError::NotConnected(_)));
    }

    #[test]
    fn malformed_command_is_dropped_not_queued() {
        let session = test_session();
        session.handle_command("P-d1".into(), "srvX".into(), b"not json".to_vec());
        assert!(session.receive_command(false, None).is_err());
    }

    #[test]
    fn well_formed_command_is_queued_with_prefix_stripped() {
        let session = test_session();
        let body = br#"{"correlation_id":"c1","completion_strategy":"optimistic","timestamp":1,"payload":{"data":"v","metadata":"m"}}"#;
        session.handle_command("P-d1".into(), "srvX".into(), body.to_vec());
        let command = session.receive_command(false, None).unwrap();
        assert_eq!(command.device_local_id, "d1");
        assert_eq!(command.service_uri, "srvX");
        assert_eq!(command.correlation_id, "c1");
    }

    #[test]
    fn reconnect_delay_formatting_does_not_panic() {
        log_reconnect_delay(5);
        log_reconnect_delay(60);
        log_reconnect_delay(125);
    }

    #[test]
    fn command_past_queue_capacity_is_dropped_without_losing_earlier_ones() {
        let session = test_session();
        let body = |n: u32| {
            format!(
                r#"{{"correlation_id":"c{n}","completion_strategy":"optimistic","timestamp":1,"payload":{{"data":"","metadata":""}}}}"#
            )
            .into_bytes()
        };
        for n in 0..COMMAND_QUEUE_CAPACITY as u32 + 1 {
            session.handle_command("P-d1".into(), "srvX".into(), body(n));
        }

        for n in 0..COMMAND_QUEUE_CAPACITY as u32 {
            let command = session.receive_command(false, None).unwrap();
            assert_eq!(command.correlation_id, format!("c{n}"));
        }
        assert!(session.receive_command(false, None).is_err());
    }
}
