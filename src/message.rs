//! Wire envelopes exchanged with the platform (§3 CommandEnvelope/EventEnvelope,
//! §6 Envelope JSON).
//!
//! Grounded on `cc_lib/client/message/_raw_message.py` for the envelope shape
//! and on `_client.py::__handleCommand`/`__send` for how the envelope is
//! parsed off an inbound topic and serialized back onto an outbound one.

use serde::{Deserialize, Serialize};

/// The free-form payload carried by both commands and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub metadata: String,
}

/// Hint from the platform on whether a command response is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStrategy {
    Optimistic,
    Pessimistic,
}

/// A command delivered to the integrator over MQTT (§3, immutable once constructed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub device_local_id: String,
    pub service_uri: String,
    pub message: Message,
    pub correlation_id: String,
    pub completion_strategy: CompletionStrategy,
    pub timestamp: i64,
}

impl CommandEnvelope {
    /// Parses the JSON body delivered on a `command/{id}/{service_uri}` topic.
    pub(crate) fn from_wire(
        device_local_id: String,
        service_uri: String,
        body: &[u8],
    ) -> Result<Self, serde_json::Error> {
        let wire: WireCommand = serde_json::from_slice(body)?;
        Ok(CommandEnvelope {
            device_local_id,
            service_uri,
            message: wire.payload,
            correlation_id: wire.correlation_id,
            completion_strategy: wire.completion_strategy,
            timestamp: wire.timestamp,
        })
    }

    /// Serializes the response envelope the same shape it was received in,
    /// with the (possibly updated) response payload.
    pub(crate) fn to_wire_json(&self) -> serde_json::Value {
        serde_json::json!({
            "correlation_id": self.correlation_id,
            "completion_strategy": self.completion_strategy,
            "timestamp": self.timestamp,
            "payload": self.message,
        })
    }
}

/// An event emitted by the integrator to the platform (§3, immutable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub device_local_id: String,
    pub service_uri: String,
    pub message: Message,
    pub correlation_id: String,
}

impl EventEnvelope {
    pub fn new(
        device_local_id: impl Into<String>,
        service_uri: impl Into<String>,
        message: Message,
    ) -> Self {
        EventEnvelope {
            device_local_id: device_local_id.into(),
            service_uri: service_uri.into(),
            message,
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// The event payload on the wire is just the message, per §6.
    pub(crate) fn to_wire_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.message).expect("Message always serializes")
    }
}

#[derive(Debug, Deserialize)]
struct WireCommand {
    correlation_id: String,
    completion_strategy: CompletionStrategy,
    timestamp: i64,
    #[serde(default)]
    payload: Message,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            data: String::new(),
            metadata: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_from_wire_and_strips_prefix_externally() {
        let body = br#"{"correlation_id":"c","completion_strategy":"optimistic","timestamp":1700000000,"payload":{"data":"v","metadata":"m"}}"#;
        let env = CommandEnvelope::from_wire("d1".into(), "srvX".into(), body).unwrap();
        assert_eq!(env.device_local_id, "d1");
        assert_eq!(env.service_uri, "srvX");
        assert_eq!(env.correlation_id, "c");
        assert_eq!(env.completion_strategy, CompletionStrategy::Optimistic);
        assert_eq!(env.message.data, "v");
        assert_eq!(env.message.metadata, "m");
    }

    #[test]
    fn missing_payload_defaults_to_empty_message() {
        let body = br#"{"correlation_id":"c","completion_strategy":"pessimistic","timestamp":1}"#;
        let env = CommandEnvelope::from_wire("d1".into(), "srvX".into(), body).unwrap();
        assert_eq!(env.message, Message::default());
    }

    #[test]
    fn event_wire_payload_is_bare_message() {
        let event = EventEnvelope::new("d1", "srvX", Message { data: "v".into(), metadata: "m".into() });
        let wire = event.to_wire_json();
        assert_eq!(wire, serde_json::json!({"data": "v", "metadata": "m"}));
    }
}
