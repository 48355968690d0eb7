#![allow(clippy::unwrap_used, clippy::float_cmp)]
// Integration tests for `BleAdapter` driven by the loopback central.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use pedalwire_radio::ble::gatt;
use pedalwire_radio::hal::ScanFilter;
use pedalwire_radio::loopback::{LoopbackCentral, LoopbackPeripheral, StaticProbe};
use pedalwire_radio::{
    AdapterEvent, BleAdapter, BleConfig, Error, MetricType, RadioAdapter, RadioStatus,
    RadioUnavailable, SensorKind,
};

// ── Helpers ─────────────────────────────────────────────────────────

const HR_ADDR: &str = "AA:BB:CC:00:00:01";

fn setup_with(
    probe: StaticProbe,
    config: BleConfig,
) -> (Arc<LoopbackCentral>, BleAdapter, mpsc::Receiver<AdapterEvent>) {
    let central = LoopbackCentral::shared();
    let adapter = BleAdapter::new(central.clone(), Arc::new(probe), config);
    let rx = adapter.take_events().unwrap();
    (central, adapter, rx)
}

fn setup() -> (Arc<LoopbackCentral>, BleAdapter, mpsc::Receiver<AdapterEvent>) {
    setup_with(StaticProbe::ready(), BleConfig::default())
}

async fn next_event(rx: &mut mpsc::Receiver<AdapterEvent>) -> AdapterEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for adapter event")
        .expect("adapter event channel closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<AdapterEvent>) {
    let res = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(res.is_err(), "expected no event, got {res:?}");
}

fn heart_strap() -> LoopbackPeripheral {
    LoopbackPeripheral::new(HR_ADDR, Some("TICKR 1A2B"))
        .with_service(gatt::HEART_RATE_SERVICE, gatt::HEART_RATE_MEASUREMENT)
}

async fn discover_and_connect(
    central: &LoopbackCentral,
    adapter: &BleAdapter,
    rx: &mut mpsc::Receiver<AdapterEvent>,
    peripheral: LoopbackPeripheral,
) -> pedalwire_radio::DeviceId {
    central.add_peripheral(peripheral).await;
    adapter.start_scanning().await.unwrap();
    let AdapterEvent::Discovered(device) = next_event(rx).await else {
        panic!("expected discovery");
    };
    assert!(adapter.connect_device(&device.id).await);
    assert!(matches!(next_event(rx).await, AdapterEvent::Connected(_)));
    device.id
}

// ── Discovery ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_filtered_scan_discovers_and_classifies() {
    let (central, adapter, mut rx) = setup();
    central
        .add_peripheral(
            LoopbackPeripheral::new("11:22:33:44:55:66", Some("Assioma Duo"))
                .with_service(gatt::CYCLING_POWER_SERVICE, gatt::CYCLING_POWER_MEASUREMENT)
                .with_rssi(-60),
        )
        .await;

    adapter.start_scanning().await.unwrap();

    let AdapterEvent::Discovered(device) = next_event(&mut rx).await else {
        panic!("expected discovery");
    };
    assert_eq!(device.id.as_str(), "ble:11:22:33:44:55:66");
    assert_eq!(device.kind, SensorKind::Power);
    assert_eq!(device.signal_strength, 50);
    assert_eq!(device.relevance_score, 90);
    assert_eq!(
        central.scan_history().await,
        vec![ScanFilter::services(&gatt::CYCLING_SERVICES)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_scanning_is_idempotent() {
    let (central, adapter, _rx) = setup();
    adapter.start_scanning().await.unwrap();
    adapter.start_scanning().await.unwrap();
    assert_eq!(central.scan_history().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_unfiltered_scan_once() {
    let (central, adapter, mut rx) = setup();
    // Advertises no cycling service, so only the unfiltered scan sees it.
    central
        .add_peripheral(LoopbackPeripheral::new("DE:AD:BE:EF:00:01", Some("KICKR CORE")))
        .await;

    adapter.start_scanning().await.unwrap();

    let AdapterEvent::Discovered(device) = next_event(&mut rx).await else {
        panic!("expected discovery after fallback");
    };
    assert_eq!(device.kind, SensorKind::Trainer);

    let history = central.scan_history().await;
    assert_eq!(history.len(), 2);
    assert!(history[1].is_unfiltered());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(central.scan_history().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_fallback_when_sensor_found() {
    let (central, adapter, mut rx) = setup();
    central.add_peripheral(heart_strap()).await;
    adapter.start_scanning().await.unwrap();
    next_event(&mut rx).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(central.scan_history().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unnamed_serviceless_devices_are_skipped() {
    let (central, adapter, mut rx) = setup();
    central
        .add_peripheral(LoopbackPeripheral::new("00:00:00:00:00:09", None))
        .await;
    adapter.start_scanning().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_permission_denied_is_classified() {
    let (_central, adapter, _rx) = setup_with(
        StaticProbe(RadioStatus::Unavailable(RadioUnavailable::PermissionDenied)),
        BleConfig::default(),
    );
    let err = adapter.start_scanning().await.unwrap_err();
    assert_eq!(
        err.unavailable_reason(),
        Some(RadioUnavailable::PermissionDenied)
    );
}

#[tokio::test]
async fn test_radio_failure_on_scan_is_classified() {
    let (central, adapter, _rx) = setup();
    central
        .set_unavailable(Some(RadioUnavailable::RadioDisabled))
        .await;
    let result = adapter.start_scanning().await;
    assert!(
        matches!(
            result,
            Err(Error::Unavailable {
                reason: RadioUnavailable::RadioDisabled,
                ..
            })
        ),
        "got {result:?}"
    );
}

// ── Connection lifecycle ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_connect_streams_heart_rate() {
    let (central, adapter, mut rx) = setup();
    let id = discover_and_connect(&central, &adapter, &mut rx, heart_strap()).await;

    assert!(
        central
            .notify(HR_ADDR, gatt::HEART_RATE_MEASUREMENT, &[0x00, 72])
            .await
    );

    let AdapterEvent::Reading(reading) = next_event(&mut rx).await else {
        panic!("expected reading");
    };
    assert_eq!(reading.device_id, id);
    assert_eq!(reading.metric, MetricType::HeartRate);
    assert_eq!(reading.value, 72.0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_unknown_device_fails() {
    let (_central, adapter, _rx) = setup();
    let id = "ble:ff:ff:ff:ff:ff:ff".parse().unwrap();
    assert!(!adapter.connect_device(&id).await);
}

#[tokio::test(start_paused = true)]
async fn test_connect_without_measurement_characteristics_fails_silently() {
    let (central, adapter, mut rx) = setup();
    let mut peripheral = LoopbackPeripheral::new("AA:00:00:00:00:02", Some("Power Meter"))
        .with_service(gatt::CYCLING_POWER_SERVICE, gatt::BATTERY_SERVICE);
    peripheral.characteristics.clear();
    central.add_peripheral(peripheral).await;
    adapter.start_scanning().await.unwrap();
    let AdapterEvent::Discovered(device) = next_event(&mut rx).await else {
        panic!("expected discovery");
    };

    assert!(!adapter.connect_device(&device.id).await);
    assert_quiet(&mut rx).await;
    assert!(!central.is_connected("AA:00:00:00:00:02"));
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_returns_false() {
    let (central, adapter, mut rx) = setup();
    let mut peripheral = heart_strap();
    peripheral.hangs_on_connect = true;
    central.add_peripheral(peripheral).await;
    adapter.start_scanning().await.unwrap();
    let AdapterEvent::Discovered(device) = next_event(&mut rx).await else {
        panic!("expected discovery");
    };

    assert!(!adapter.connect_device(&device.id).await);
    assert_quiet(&mut rx).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_emits_event_and_stops_readings() {
    let (central, adapter, mut rx) = setup();
    let id = discover_and_connect(&central, &adapter, &mut rx, heart_strap()).await;

    assert!(adapter.disconnect_device(&id).await);
    assert_eq!(next_event(&mut rx).await, AdapterEvent::Disconnected(id.clone()));
    assert!(!adapter.disconnect_device(&id).await);

    assert!(
        !central
            .notify(HR_ADDR, gatt::HEART_RATE_MEASUREMENT, &[0x00, 80])
            .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_emits_disconnected() {
    let (central, adapter, mut rx) = setup();
    let id = discover_and_connect(&central, &adapter, &mut rx, heart_strap()).await;

    central.drop_link(HR_ADDR).await;
    assert_eq!(next_event(&mut rx).await, AdapterEvent::Disconnected(id));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_counted() {
    let (central, adapter, mut rx) = setup();
    discover_and_connect(&central, &adapter, &mut rx, heart_strap()).await;

    central
        .notify(HR_ADDR, gatt::HEART_RATE_MEASUREMENT, &[0x01, 0x48])
        .await;
    central
        .notify(HR_ADDR, gatt::HEART_RATE_MEASUREMENT, &[0x00, 0x50])
        .await;

    let AdapterEvent::Reading(reading) = next_event(&mut rx).await else {
        panic!("expected reading");
    };
    assert_eq!(reading.value, 80.0);
    assert_eq!(adapter.decode_errors(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_idempotent_and_releases() {
    let (central, adapter, mut rx) = setup();
    let id = discover_and_connect(&central, &adapter, &mut rx, heart_strap()).await;

    adapter.shutdown().await;
    adapter.shutdown().await;

    assert_eq!(next_event(&mut rx).await, AdapterEvent::Disconnected(id));
    assert!(central.is_released());
    assert!(adapter.start_scanning().await.is_err());
}
