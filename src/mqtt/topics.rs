//! MQTT topic construction and parsing (§6 "MQTT topics").
//!
//! Grounded on `spotflow::iothub::topics` (plain `format!`-based builders,
//! no templating crate).

pub(crate) fn command_filter(prefixed_device_id: &str) -> String {
    format!("command/{prefixed_device_id}/+")
}

pub(crate) fn response_topic(prefixed_device_id: &str, service_uri: &str) -> String {
    format!("response/{prefixed_device_id}/{service_uri}")
}

pub(crate) fn event_topic(prefixed_device_id: &str, service_uri: &str) -> String {
    format!("event/{prefixed_device_id}/{service_uri}")
}

/// Splits an inbound `command/{prefixed_device_id}/{service_uri}` topic.
/// Returns `None` if the topic doesn't have the expected shape.
pub(crate) fn parse_command_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix("command/")?;
    let (device, service_uri) = rest.split_once('/')?;
    if device.is_empty() || service_uri.is_empty() {
        return None;
    }
    Some((device, service_uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_command_topic() {
        let (device, service_uri) = parse_command_topic("command/P-d1/srvX").unwrap();
        assert_eq!(device, "P-d1");
        assert_eq!(service_uri, "srvX");
    }

    #[test]
    fn rejects_malformed_topics() {
        assert!(parse_command_topic("response/P-d1/srvX").is_none());
        assert!(parse_command_topic("command/P-d1").is_none());
        assert!(parse_command_topic("command//srvX").is_none());
    }

    #[test]
    fn builds_expected_topics() {
        assert_eq!(command_filter("P-d1"), "command/P-d1/+");
        assert_eq!(response_topic("P-d1", "srvX"), "response/P-d1/srvX");
        assert_eq!(event_topic("P-d1", "srvX"), "event/P-d1/srvX");
    }
}
