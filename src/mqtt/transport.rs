//! The `rumqttc`-backed MQTT transport (§4.1 "the transport owns signalling
//! EventWorkers", §5 "single event loop inside the MQTT transport").
//!
//! Grounded on `spotflow::iothub::mod.rs` (building `MqttOptions`, enabling
//! native-tls transport, `AsyncClient::new`) and `spotflow::iothub::eventloop`
//! (a `select!` loop over `rumqttc_eventloop.poll()` driven from a background
//! context, dispatching on `Event::Incoming`/`Event::Outgoing`). Unlike the
//! teacher, which spawns one dedicated OS thread to drive the whole
//! connection future, this transport runs its poll loop as a task on its own
//! small multi-threaded runtime and lets synchronous calls (`subscribe`,
//! `publish`, `disconnect`) drive that same runtime via `block_on` from the
//! calling thread — both are valid ways to bridge async rumqttc onto a
//! blocking API; this one needs no extra thread bookkeeping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    TlsConfiguration, Transport,
};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::worker::event::EventWorkerTable;
use crate::worker::{new_pair, Completer, Future};

use super::topics;

/// Events the transport pushes up to whatever owns it (the session manager).
pub enum TransportEvent {
    Connected,
    Disconnected { code: i32 },
    Command { prefixed_device_id: String, service_uri: String, payload: Vec<u8> },
}

pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

struct Running {
    runtime: Runtime,
    client: AsyncClient,
    poll_task: JoinHandle<()>,
    cancellation: CancellationToken,
    /// Set by `poll_loop` itself once it has already torn the connection down
    /// and fired `Disconnected` after a broker/transport-level error. Lets
    /// `disconnect()`/`reset()` notice the connection is already gone instead
    /// of firing a second, spurious `Disconnected` event.
    failed: Arc<AtomicBool>,
    connect_ack: Arc<Mutex<Option<Completer<()>>>>,
    subscribe_acks: Arc<EventWorkerTable<Vec<u8>>>,
    unsubscribe_acks: Arc<EventWorkerTable<()>>,
    publish_acks: Arc<EventWorkerTable<()>>,
    pending_subscribe_order: Arc<Mutex<VecDeque<Completer<Vec<u8>>>>>,
    pending_unsubscribe_order: Arc<Mutex<VecDeque<Completer<()>>>>,
    pending_publish_order: Arc<Mutex<VecDeque<Completer<()>>>>,
}

pub struct MqttTransport {
    config: MqttConfig,
    sink: EventSink,
    running: Mutex<Option<Running>>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig, sink: EventSink) -> Self {
        MqttTransport { config, sink, running: Mutex::new(None) }
    }

    pub fn is_connected(&self) -> bool {
        match self.running.lock().expect("transport mutex poisoned").as_ref() {
            Some(running) => !running.failed.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Opens a fresh connection. Fails the returned future immediately if a
    /// connection is already active — the caller (SessionManager) is
    /// responsible for calling `reset()` first when reconnecting.
    pub fn connect(&self, client_id: &str, username: &str, password: &str) -> Future<()> {
        let mut guard = self.running.lock().expect("transport mutex poisoned");
        if guard.is_some() {
            let (future, completer) = new_pair();
            completer.complete(Err(anyhow!("transport already connected")));
            return future;
        }

        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keepalive_secs));
        options.set_credentials(username, password);
        if self.config.tls {
            options.set_transport(Transport::Tls(TlsConfiguration::Native));
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let (future, completer) = new_pair();
                completer.complete(Err(anyhow::Error::new(e).context("building MQTT runtime")));
                return future;
            }
        };

        let (connect_future, connect_completer) = new_pair::<()>();
        let connect_ack = Arc::new(Mutex::new(Some(connect_completer)));
        let subscribe_acks = Arc::new(EventWorkerTable::new());
        let unsubscribe_acks = Arc::new(EventWorkerTable::new());
        let publish_acks = Arc::new(EventWorkerTable::new());
        let pending_subscribe_order = Arc::new(Mutex::new(VecDeque::new()));
        let pending_unsubscribe_order = Arc::new(Mutex::new(VecDeque::new()));
        let pending_publish_order = Arc::new(Mutex::new(VecDeque::new()));
        let cancellation = CancellationToken::new();
        let failed = Arc::new(AtomicBool::new(false));

        let poll_task = runtime.spawn(poll_loop(
            eventloop,
            cancellation.clone(),
            failed.clone(),
            connect_ack.clone(),
            subscribe_acks.clone(),
            unsubscribe_acks.clone(),
            publish_acks.clone(),
            pending_subscribe_order.clone(),
            pending_unsubscribe_order.clone(),
            pending_publish_order.clone(),
            self.sink.clone(),
        ));

        *guard = Some(Running {
            runtime,
            client,
            poll_task,
            cancellation,
            failed,
            connect_ack,
            subscribe_acks,
            unsubscribe_acks,
            publish_acks,
            pending_subscribe_order,
            pending_unsubscribe_order,
            pending_publish_order,
        });

        connect_future
    }

    /// Sends an MQTT DISCONNECT and tears the connection down. Idempotent:
    /// calling this with no active connection is a no-op.
    pub fn disconnect(&self) {
        let running = self.running.lock().expect("transport mutex poisoned").take();
        let Some(running) = running else { return };
        if running.failed.load(Ordering::SeqCst) {
            running.poll_task.abort();
            return;
        }
        let _ = running.runtime.block_on(running.client.disconnect());
        self.teardown(running, 0);
    }

    /// Drops the connection without a clean MQTT DISCONNECT, in preparation
    /// for a fresh `connect()` call on the next reconnect attempt (§10.5,
    /// supplemented `MqttTransport::reset`).
    pub fn reset(&self) {
        let running = self.running.lock().expect("transport mutex poisoned").take();
        let Some(running) = running else { return };
        if running.failed.load(Ordering::SeqCst) {
            running.poll_task.abort();
            return;
        }
        self.teardown(running, 1);
    }

    fn teardown(&self, running: Running, code: i32) {
        running.cancellation.cancel();
        running.poll_task.abort();
        let reason = || anyhow!("transport disconnected");
        if let Some(completer) = running.connect_ack.lock().expect("connect ack poisoned").take() {
            completer.complete(Err(reason()));
        }
        running.subscribe_acks.fail_all(reason);
        running.unsubscribe_acks.fail_all(reason);
        running.publish_acks.fail_all(reason);
        for completer in running.pending_subscribe_order.lock().expect("poisoned").drain(..) {
            completer.complete(Err(reason()));
        }
        for completer in running.pending_unsubscribe_order.lock().expect("poisoned").drain(..) {
            completer.complete(Err(reason()));
        }
        for completer in running.pending_publish_order.lock().expect("poisoned").drain(..) {
            completer.complete(Err(reason()));
        }
        (self.sink)(TransportEvent::Disconnected { code });
    }

    pub fn subscribe(&self, topic: &str, qos: u8) -> Future<Vec<u8>> {
        let guard = self.running.lock().expect("transport mutex poisoned");
        let Some(running) = guard.as_ref() else {
            let (future, completer) = new_pair();
            completer.complete(Err(anyhow!("not connected")));
            return future;
        };
        let (future, completer) = new_pair();
        running.pending_subscribe_order.lock().expect("poisoned").push_back(completer);
        let client = running.client.clone();
        let topic = topic.to_string();
        let result = running.runtime.block_on(client.subscribe(topic, to_rumqttc_qos(qos)));
        if let Err(e) = result {
            if let Some(completer) = running.pending_subscribe_order.lock().expect("poisoned").pop_back() {
                completer.complete(Err(anyhow!(e.to_string())));
            }
        }
        future
    }

    pub fn unsubscribe(&self, topic: &str) -> Future<()> {
        let guard = self.running.lock().expect("transport mutex poisoned");
        let Some(running) = guard.as_ref() else {
            let (future, completer) = new_pair();
            completer.complete(Err(anyhow!("not connected")));
            return future;
        };
        let (future, completer) = new_pair();
        running.pending_unsubscribe_order.lock().expect("poisoned").push_back(completer);
        let client = running.client.clone();
        let topic = topic.to_string();
        let result = running.runtime.block_on(client.unsubscribe(topic));
        if let Err(e) = result {
            if let Some(completer) = running.pending_unsubscribe_order.lock().expect("poisoned").pop_back() {
                completer.complete(Err(anyhow!(e.to_string())));
            }
        }
        future
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>, qos: u8) -> Future<()> {
        let guard = self.running.lock().expect("transport mutex poisoned");
        let Some(running) = guard.as_ref() else {
            let (future, completer) = new_pair();
            completer.complete(Err(anyhow!("not connected")));
            return future;
        };
        let client = running.client.clone();
        let rumqttc_qos = to_rumqttc_qos(qos);
        let topic = topic.to_string();

        if qos == 0 {
            let result = running.runtime.block_on(client.publish(topic, rumqttc_qos, false, payload));
            let (future, completer) = new_pair();
            match result {
                Ok(()) => completer.complete(Ok(())),
                Err(e) => completer.complete(Err(anyhow!(e.to_string()))),
            }
            return future;
        }

        let (future, completer) = new_pair();
        running.pending_publish_order.lock().expect("poisoned").push_back(completer);
        let result = running.runtime.block_on(client.publish(topic, rumqttc_qos, false, payload));
        if let Err(e) = result {
            if let Some(completer) = running.pending_publish_order.lock().expect("poisoned").pop_back() {
                completer.complete(Err(anyhow!(e.to_string())));
            }
        }
        future
    }
}

fn to_rumqttc_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    mut eventloop: rumqttc::EventLoop,
    cancellation: CancellationToken,
    failed: Arc<AtomicBool>,
    connect_ack: Arc<Mutex<Option<Completer<()>>>>,
    subscribe_acks: Arc<EventWorkerTable<Vec<u8>>>,
    unsubscribe_acks: Arc<EventWorkerTable<()>>,
    publish_acks: Arc<EventWorkerTable<()>>,
    pending_subscribe_order: Arc<Mutex<VecDeque<Completer<Vec<u8>>>>>,
    pending_unsubscribe_order: Arc<Mutex<VecDeque<Completer<()>>>>,
    pending_publish_order: Arc<Mutex<VecDeque<Completer<()>>>>,
    sink: EventSink,
) {
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                log::debug!("stopping MQTT poll loop: cancelled");
                return;
            }
            notification = eventloop.poll() => {
                match notification {
                    Ok(Event::Incoming(packet)) => handle_incoming(
                        packet,
                        &connect_ack,
                        &subscribe_acks,
                        &unsubscribe_acks,
                        &publish_acks,
                        &sink,
                    ),
                    Ok(Event::Outgoing(outgoing)) => handle_outgoing(
                        outgoing,
                        &subscribe_acks,
                        &unsubscribe_acks,
                        &publish_acks,
                        &pending_subscribe_order,
                        &pending_unsubscribe_order,
                        &pending_publish_order,
                    ),
                    Err(e) => {
                        log::debug!("MQTT connection error: {e}");
                        let message = e.to_string();
                        if let Some(completer) = connect_ack.lock().expect("connect ack poisoned").take() {
                            completer.complete(Err(anyhow!(message.clone())));
                        }
                        subscribe_acks.fail_all(|| anyhow!(message.clone()));
                        unsubscribe_acks.fail_all(|| anyhow!(message.clone()));
                        publish_acks.fail_all(|| anyhow!(message.clone()));
                        failed.store(true, Ordering::SeqCst);
                        sink(TransportEvent::Disconnected { code: 1 });
                        return;
                    }
                }
            }
        }
    }
}

fn handle_incoming(
    packet: Packet,
    connect_ack: &Mutex<Option<Completer<()>>>,
    subscribe_acks: &EventWorkerTable<Vec<u8>>,
    unsubscribe_acks: &EventWorkerTable<()>,
    publish_acks: &EventWorkerTable<()>,
    sink: &EventSink,
) {
    match packet {
        Packet::ConnAck(ack) => {
            if let Some(completer) = connect_ack.lock().expect("connect ack poisoned").take() {
                if ack.code == ConnectReturnCode::Success {
                    completer.complete(Ok(()));
                    sink(TransportEvent::Connected);
                } else {
                    completer.complete(Err(anyhow!("broker refused connection: {:?}", ack.code)));
                }
            }
        }
        Packet::Publish(publish) => match topics::parse_command_topic(&publish.topic) {
            Some((device, service_uri)) => sink(TransportEvent::Command {
                prefixed_device_id: device.to_string(),
                service_uri: service_uri.to_string(),
                payload: publish.payload.to_vec(),
            }),
            None => log::warn!("ignoring message on unexpected topic {:?}", publish.topic),
        },
        Packet::SubAck(ack) => {
            let codes: Vec<u8> = ack
                .return_codes
                .iter()
                .map(|code| match code {
                    SubscribeReasonCode::Success(qos) => *qos as u8,
                    SubscribeReasonCode::Failure => 128,
                })
                .collect();
            subscribe_acks.complete(ack.pkid, Ok(codes));
        }
        Packet::UnsubAck(ack) => unsubscribe_acks.complete(ack.pkid, Ok(())),
        // QoS 1 completes on PUBACK; QoS 2 completes on PUBCOMP (the end of
        // the PUBREC/PUBREL/PUBCOMP handshake) and never sends a PUBACK at
        // all (§4.7: "For QoS >= 1, completion is signaled on PUBACK/PUBCOMP").
        Packet::PubAck(ack) => publish_acks.complete(ack.pkid, Ok(())),
        Packet::PubComp(ack) => publish_acks.complete(ack.pkid, Ok(())),
        _ => {}
    }
}

/// Outgoing events are how rumqttc reveals the packet identifier it assigned
/// to a request we made earlier through `AsyncClient`. We FIFO-match them
/// against the completers queued by `subscribe`/`unsubscribe`/`publish` and
/// re-key each one into the corresponding ack table under its real pkid.
fn handle_outgoing(
    outgoing: Outgoing,
    subscribe_acks: &EventWorkerTable<Vec<u8>>,
    unsubscribe_acks: &EventWorkerTable<()>,
    publish_acks: &EventWorkerTable<()>,
    pending_subscribe_order: &Mutex<VecDeque<Completer<Vec<u8>>>>,
    pending_unsubscribe_order: &Mutex<VecDeque<Completer<()>>>,
    pending_publish_order: &Mutex<VecDeque<Completer<()>>>,
) {
    match outgoing {
        Outgoing::Subscribe(pkid) => {
            if let Some(completer) = pending_subscribe_order.lock().expect("poisoned").pop_front() {
                subscribe_acks.insert(pkid, completer);
            }
        }
        Outgoing::Unsubscribe(pkid) => {
            if let Some(completer) = pending_unsubscribe_order.lock().expect("poisoned").pop_front() {
                unsubscribe_acks.insert(pkid, completer);
            }
        }
        Outgoing::Publish(pkid) => {
            if let Some(completer) = pending_publish_order.lock().expect("poisoned").pop_front() {
                publish_acks.insert(pkid, completer);
            }
        }
        _ => {}
    }
}
