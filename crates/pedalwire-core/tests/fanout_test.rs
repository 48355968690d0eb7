#![allow(clippy::unwrap_used)]
// Integration tests for `Fanout` on top of a loopback-backed aggregator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use pedalwire_core::{
    Aggregator, AggregatorConfig, ClientId, Fanout, MemoryStore, ServerMessage, Topic,
};
use pedalwire_radio::ble::gatt;
use pedalwire_radio::loopback::{LoopbackAntStick, LoopbackCentral, LoopbackPeripheral, StaticProbe};
use pedalwire_radio::{AntAdapter, AntConfig, BleAdapter, BleConfig, RadioAdapter};

// ── Helpers ─────────────────────────────────────────────────────────

const HR_ADDR: &str = "AA:BB:CC:00:00:01";

async fn setup() -> (Arc<LoopbackCentral>, Fanout) {
    let central = LoopbackCentral::shared();
    central
        .add_peripheral(
            LoopbackPeripheral::new(HR_ADDR, Some("Polar H10"))
                .with_service(gatt::HEART_RATE_SERVICE, gatt::HEART_RATE_MEASUREMENT),
        )
        .await;
    let adapters: Vec<Arc<dyn RadioAdapter>> = vec![
        Arc::new(BleAdapter::new(
            central.clone(),
            Arc::new(StaticProbe::ready()),
            BleConfig::default(),
        )),
        Arc::new(AntAdapter::new(Arc::new(LoopbackAntStick::new()), AntConfig::default())),
    ];
    let agg = Aggregator::new(AggregatorConfig::default(), adapters, Arc::new(MemoryStore::new()));
    let fanout = Fanout::new(agg, 64);
    fanout.start().await;
    (central, fanout)
}

async fn request(fanout: &Fanout, client: ClientId, text: &str) -> serde_json::Value {
    let reply = fanout.handle_text(client, text).await;
    serde_json::to_value(&reply).unwrap()
}

/// Collect everything queued for a client after letting delivery settle.
async fn received(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn topics(messages: &[ServerMessage]) -> Vec<Topic> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Event { topic, .. } => Some(*topic),
            ServerMessage::Response { .. } => None,
        })
        .collect()
}

// ── Delivery ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_sensor_data_subscriber_never_sees_device_events() {
    let (central, fanout) = setup().await;
    let (data_client, mut data_rx) = fanout.register_client();
    let (device_client, mut device_rx) = fanout.register_client();
    request(&fanout, data_client, r#"{"type":"subscribe","topic":"sensor-data"}"#).await;
    request(&fanout, device_client, r#"{"type":"subscribe","topic":"device-events"}"#).await;

    let scan = request(&fanout, device_client, r#"{"type":"start-scanning","request_id":1}"#).await;
    assert_eq!(scan["success"], true);
    assert_eq!(scan["request_id"], 1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let connect = request(
        &fanout,
        device_client,
        r#"{"type":"connect-device","device_id":"ble:aa:bb:cc:00:00:01"}"#,
    )
    .await;
    assert_eq!(connect["success"], true, "{connect}");
    assert_eq!(connect["data"]["state"], "connected");

    assert!(central.notify(HR_ADDR, gatt::HEART_RATE_MEASUREMENT, &[0x00, 0x48]).await);

    let data_topics = topics(&received(&mut data_rx).await);
    assert_eq!(data_topics, [Topic::SensorData]);

    let device_topics = topics(&received(&mut device_rx).await);
    assert!(!device_topics.is_empty());
    assert!(device_topics.iter().all(|t| *t == Topic::DeviceEvents));
}

#[tokio::test(start_paused = true)]
async fn test_session_events_reach_session_subscribers() {
    let (_central, fanout) = setup().await;
    let (client, mut rx) = fanout.register_client();
    request(&fanout, client, r#"{"type":"subscribe","topic":"session-events"}"#).await;

    let started = request(&fanout, client, r#"{"type":"start-session","name":"sweetspot"}"#).await;
    assert_eq!(started["data"]["name"], "sweetspot");
    assert_eq!(started["data"]["status"], "active");

    let paused = request(&fanout, client, r#"{"type":"pause-session"}"#).await;
    assert_eq!(paused["data"]["status"], "paused");
    let resumed = request(&fanout, client, r#"{"type":"resume-session"}"#).await;
    assert_eq!(resumed["data"]["status"], "active");
    let stopped = request(&fanout, client, r#"{"type":"stop-session"}"#).await;
    assert_eq!(stopped["data"]["status"], "completed");

    let events = received(&mut rx).await;
    assert_eq!(topics(&events), [Topic::SessionEvents; 4]);
}

// ── Control surface ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_get_status_lists_devices() {
    let (_central, fanout) = setup().await;
    let (client, _rx) = fanout.register_client();
    request(&fanout, client, r#"{"type":"start-scanning"}"#).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = request(&fanout, client, r#"{"type":"get-status","request_id":"s"}"#).await;
    assert_eq!(status["success"], true);
    assert_eq!(status["request_id"], "s");
    assert_eq!(status["data"]["scanning"], true);
    assert_eq!(status["data"]["discovered"][0]["name"], "Polar H10");
    assert_eq!(status["data"]["discovered"][0]["kind"], "heart_rate");
    assert_eq!(status["data"]["transports"].as_array().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_control_errors_are_structured() {
    let (_central, fanout) = setup().await;
    let (client, _rx) = fanout.register_client();

    let missing = request(
        &fanout,
        client,
        r#"{"type":"connect-device","device_id":"ant:hr-9","request_id":3}"#,
    )
    .await;
    assert_eq!(missing["success"], false);
    assert_eq!(missing["error"]["code"], "device_not_found");

    let no_session = request(&fanout, client, r#"{"type":"pause-session"}"#).await;
    assert_eq!(no_session["error"]["code"], "no_active_session");

    let unknown = request(&fanout, client, r#"{"type":"reboot"}"#).await;
    assert_eq!(unknown["success"], false);
    assert_eq!(unknown["error"]["code"], "invalid_request");
}

#[tokio::test(start_paused = true)]
async fn test_removed_client_gets_nothing() {
    let (_central, fanout) = setup().await;
    let (client, mut rx) = fanout.register_client();
    request(&fanout, client, r#"{"type":"subscribe","topic":"session-events"}"#).await;
    fanout.remove_client(client);

    let (other, _other_rx) = fanout.register_client();
    request(&fanout, other, r#"{"type":"start-session"}"#).await;

    assert!(received(&mut rx).await.is_empty());
    assert_eq!(fanout.client_count(), 1);
}
