//! The configuration surface recognized by the connector core (§6).
//!
//! Grounded on `spotflow::persistence::sqlite::SdkConfiguration` for the
//! shape of "everything the SDK needs before it can start", and on
//! `cc_lib/client/_client.py`'s `cc_conf.auth`/`cc_conf.credentials`/
//! `cc_conf.api`/`cc_conf.hub`/`cc_conf.device` accesses for the exact field
//! groups this struct's sections mirror. Deserialized with `serde` the way
//! the teacher deserializes its own configuration fragments.

use serde::Deserialize;

/// Top-level configuration for the connector core.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    pub auth: AuthEndpointConfig,
    pub credentials: CredentialsConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    pub connector: MqttConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
}

/// The OpenID endpoint used to mint bearer tokens (external contract, §2).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthEndpointConfig {
    #[serde(default)]
    pub tls: bool,
    pub host: String,
    pub path: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    pub user: String,
    pub pw: String,
}

/// The HTTP control plane used for hub and device lifecycle (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub tls: bool,
    pub host: String,
    pub hub_endpt: String,
    pub device_endpt: String,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// Sleep after device creation to let the platform registry converge (§4.2).
    #[serde(default = "default_eventual_consistency_delay_secs")]
    pub eventual_consistency_delay_secs: u64,
}

fn default_eventual_consistency_delay_secs() -> u64 {
    1
}

/// The initial hub identity. `id` is empty until `init_hub` has run once;
/// after that, hub identity is tracked at runtime by
/// [`crate::cloud::hub::HubController`], not mutated back into this struct.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// `id_prefix` is usually left unset and generated once via
/// [`crate::util::generate_device_id_prefix`], then expected to be persisted
/// by the integrator's own configuration storage for future runs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub id_prefix: Option<String>,
}

/// Quality of service, mapped from the configuration-facing `low/normal/high`
/// tiers (§6) to the numeric MQTT QoS levels used by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qos {
    Low,
    Normal,
    High,
}

impl Qos {
    pub fn as_u8(self) -> u8 {
        match self {
            Qos::Low => 0,
            Qos::Normal => 1,
            Qos::High => 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_msg_retry_secs")]
    pub msg_retry_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_loop_time_ms")]
    pub loop_time_ms: u64,
    #[serde(default = "default_qos")]
    pub qos: Qos,
    pub reconn_delay_min_secs: u64,
    pub reconn_delay_max_secs: u64,
    pub reconn_delay_factor: f64,
}

fn default_msg_retry_secs() -> u64 {
    20
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_loop_time_ms() -> u64 {
    10
}

fn default_qos() -> Qos {
    Qos::Normal
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub rotating_log: Option<String>,
    #[serde(default = "default_backup_count")]
    pub rotating_log_backup_count: u32,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: default_log_level(),
            rotating_log: None,
            rotating_log_backup_count: default_backup_count(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backup_count() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config() {
        let raw = r#"
            [auth]
            host = "auth.example.com"
            path = "realms/devices"
            id = "client-id"

            [credentials]
            user = "alice"
            pw = "secret"

            [api]
            host = "api.example.com"
            hub_endpt = "hubs"
            device_endpt = "devices"
            request_timeout_secs = 10

            [connector]
            host = "mqtt.example.com"
            port = 8883
            reconn_delay_min_secs = 10
            reconn_delay_max_secs = 300
            reconn_delay_factor = 1.5
        "#;
        let config: ConnectorConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.credentials.user, "alice");
        assert_eq!(config.connector.qos, Qos::Normal);
        assert_eq!(config.api.eventual_consistency_delay_secs, 1);
    }
}
