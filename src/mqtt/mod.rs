//! The MQTT transport: owns the broker connection and signals completion of
//! connect/subscribe/unsubscribe/publish through the [`crate::worker`] layer
//! (§4.1, §5).

pub mod topics;
pub mod transport;

pub use transport::{EventSink, MqttTransport, TransportEvent};
