//! Integration tests for hub/device HTTP reconciliation, exercised against a
//! mock platform API (§4.2).

use connector_core::auth::StaticToken;
use connector_core::cloud::hub::HubController;
use connector_core::config::ApiConfig;
use connector_core::device::Device;
use connector_core::error::{DeviceError, HubError};
use connector_core::util::hash_devices;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("ureq=warn,info"))
        .is_test(true)
        .try_init();
}

fn api_config(mock_server: &MockServer) -> ApiConfig {
    ApiConfig {
        tls: false,
        host: mock_server.uri().replace("http://", ""),
        hub_endpt: "hubs".into(),
        device_endpt: "devices".into(),
        request_timeout_secs: 5,
        eventual_consistency_delay_secs: 0,
    }
}

fn controller(mock_server: &MockServer, hub_id: Option<&str>) -> HubController {
    HubController::new(
        &api_config(mock_server),
        Box::new(StaticToken::new("tok")),
        hub_id.map(String::from),
        Some("my-hub".into()),
        "P".into(),
    )
    .unwrap()
}

mod hub_lifecycle {
    use super::*;

    #[tokio::test]
    async fn init_hub_creates_a_new_hub_when_none_is_configured() {
        init_logging();
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hubs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "hub-1",
                "name": "my-hub",
                "hash": null,
                "device_local_ids": []
            })))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, None);
        hub.init_hub().unwrap();

        assert!(hub.is_initialized());
        assert_eq!(hub.hub_id().as_deref(), Some("hub-1"));
    }

    #[tokio::test]
    async fn init_hub_confirms_an_existing_hub_via_head() {
        init_logging();
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/hubs/hub-1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, Some("hub-1"));
        hub.init_hub().unwrap();

        assert!(hub.is_initialized());
        assert_eq!(hub.hub_id().as_deref(), Some("hub-1"));
    }

    #[tokio::test]
    async fn init_hub_clears_a_stale_configured_id_on_404() {
        init_logging();
        let mock_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/hubs/stale-id"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, Some("stale-id"));
        let err = hub.init_hub().unwrap_err();

        assert!(matches!(err, HubError::NotFound));
        assert!(!hub.is_initialized());
        assert_eq!(hub.hub_id(), None);
    }

    #[tokio::test]
    async fn sync_hub_skips_the_put_when_the_hash_already_matches() {
        init_logging();
        let mock_server = MockServer::start().await;
        let devices = [Device::new("d1", "Lamp", "type-a")];
        let hash = hash_devices(&devices);

        Mock::given(method("GET"))
            .and(path("/hubs/hub-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "hub-1",
                "name": "my-hub",
                "hash": hash,
                "device_local_ids": ["P-d1"]
            })))
            .mount(&mock_server)
            .await;
        // A PUT would be a bug here (hash already matches); make it fail loudly.
        Mock::given(method("PUT"))
            .and(path("/hubs/hub-1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, Some("hub-1"));
        hub.sync_hub(&devices).unwrap();
    }

    #[tokio::test]
    async fn sync_hub_pushes_the_device_set_on_hash_mismatch() {
        init_logging();
        let mock_server = MockServer::start().await;
        let devices = [Device::new("d1", "Lamp", "type-a")];

        Mock::given(method("GET"))
            .and(path("/hubs/hub-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "hub-1",
                "name": "my-hub",
                "hash": "stale-hash",
                "device_local_ids": []
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/hubs/hub-1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, Some("hub-1"));
        hub.sync_hub(&devices).unwrap();
    }

    #[tokio::test]
    async fn sync_hub_without_a_hub_id_fails_fast() {
        init_logging();
        let mock_server = MockServer::start().await;
        let hub = controller(&mock_server, None);
        let err = hub.sync_hub(&[]).unwrap_err();
        assert!(matches!(err, HubError::NotInitialized));
    }
}

mod device_lifecycle {
    use super::*;

    #[tokio::test]
    async fn add_device_creates_when_absent_on_the_platform() {
        init_logging();
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices/P-d1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "remote-1"})))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, Some("hub-1"));
        let mut device = Device::new("d1", "Lamp", "type-a");
        hub.add_device(&mut device).unwrap();

        assert_eq!(device.remote_id(), Some("remote-1"));
    }

    #[tokio::test]
    async fn add_device_updates_when_already_present() {
        init_logging();
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices/P-d1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "remote-1"})))
            .mount(&mock_server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/devices/P-d1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, Some("hub-1"));
        let mut device = Device::new("d1", "Lamp", "type-a");
        hub.add_device(&mut device).unwrap();

        assert_eq!(device.remote_id(), Some("remote-1"));
    }

    #[tokio::test]
    async fn update_device_without_a_remote_id_fails_without_a_request() {
        init_logging();
        let mock_server = MockServer::start().await;
        let hub = controller(&mock_server, Some("hub-1"));
        let device = Device::new("d1", "Lamp", "type-a");

        let err = hub.update_device(&device).unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(ref id) if id == "d1"));
    }

    #[tokio::test]
    async fn delete_device_treats_a_missing_remote_device_as_success() {
        init_logging();
        let mock_server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devices/P-d1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, Some("hub-1"));
        hub.delete_device("d1").unwrap();
    }

    #[tokio::test]
    async fn delete_device_propagates_server_errors() {
        init_logging();
        let mock_server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devices/P-d1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let hub = controller(&mock_server, Some("hub-1"));
        let err = hub.delete_device("d1").unwrap_err();
        assert!(matches!(err, DeviceError::Delete(ref id, _) if id == "d1"));
    }
}
