// ── Short-range (BLE) adapter ──
//
// Scans for cycling GATT services, connects on request, subscribes to
// measurement characteristics, and decodes notifications. All radio
// events are consumed by a single event loop per adapter.

pub mod classify;
pub mod decode;
pub mod gatt;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{ADAPTER_EVENT_BUFFER, RadioAdapter};
use crate::error::{Error, RadioUnavailable};
use crate::hal::{Advertisement, BleCentral, BleEvent, PermissionProbe, ScanFilter};
use crate::revolution::DEFAULT_WHEEL_CIRCUMFERENCE_M;
use crate::types::{
    AdapterEvent, DeviceId, DiscoveredDevice, RadioStatus, Transport, signal_strength,
};

use self::classify::classify;
use self::decode::FrameDecoder;

/// Tunables for the BLE adapter.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Upper bound on connect + service discovery + subscribe.
    pub handshake_timeout: Duration,
    /// How long a filtered scan may find nothing before widening.
    pub fallback_grace: Duration,
    pub wheel_circumference_m: f64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            fallback_grace: Duration::from_secs(5),
            wheel_circumference_m: DEFAULT_WHEEL_CIRCUMFERENCE_M,
        }
    }
}

#[derive(Debug, Clone)]
struct Peripheral {
    address: String,
    device: DiscoveredDevice,
}

#[derive(Debug, Default)]
struct ScanState {
    scanning: bool,
    fallback: Option<CancellationToken>,
}

// ── BleAdapter ───────────────────────────────────────────────────

/// BLE transport adapter. Cheaply cloneable.
#[derive(Clone)]
pub struct BleAdapter {
    inner: Arc<BleInner>,
}

struct BleInner {
    config: BleConfig,
    central: Arc<dyn BleCentral>,
    probe: Arc<dyn PermissionProbe>,
    event_tx: mpsc::Sender<AdapterEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<AdapterEvent>>>,
    discovered: DashMap<DeviceId, Peripheral>,
    connected: DashMap<DeviceId, Peripheral>,
    scan: Mutex<ScanState>,
    /// Mirrors `scan.scanning` for the event loop.
    scanning: AtomicBool,
    decode_errors: AtomicU64,
    cancel: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl BleAdapter {
    pub fn new(
        central: Arc<dyn BleCentral>,
        probe: Arc<dyn PermissionProbe>,
        config: BleConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(ADAPTER_EVENT_BUFFER);
        Self {
            inner: Arc::new(BleInner {
                config,
                central,
                probe,
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                discovered: DashMap::new(),
                connected: DashMap::new(),
                scan: Mutex::new(ScanState::default()),
                scanning: AtomicBool::new(false),
                decode_errors: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                event_loop: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the event loop on first use.
    async fn ensure_event_loop(&self) -> Result<(), Error> {
        let mut slot = self.inner.event_loop.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let rx = self.inner.central.take_events().ok_or(Error::Operation {
            transport: Transport::Ble,
            message: "central event stream already taken".into(),
        })?;
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.clone();
        *slot = Some(tokio::spawn(ble_event_loop(inner, rx, cancel)));
        Ok(())
    }

    async fn start(&self) -> Result<(), Error> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Operation {
                transport: Transport::Ble,
                message: "adapter is shut down".into(),
            });
        }

        if let RadioStatus::Unavailable(reason) = self.inner.probe.probe().await {
            warn!(%reason, "BLE radio unavailable");
            return Err(Error::unavailable(Transport::Ble, reason));
        }

        let mut scan = self.inner.scan.lock().await;
        if scan.scanning {
            return Ok(());
        }
        self.ensure_event_loop().await?;

        self.inner.discovered.clear();
        self.inner
            .central
            .start_scan(ScanFilter::services(&gatt::CYCLING_SERVICES))
            .await?;
        scan.scanning = true;
        self.inner.scanning.store(true, Ordering::SeqCst);

        let token = self.inner.cancel.child_token();
        scan.fallback = Some(token.clone());
        tokio::spawn(fallback_scan_task(Arc::clone(&self.inner), token));

        info!("BLE scan started (cycling services)");
        Ok(())
    }

    async fn stop(&self) {
        let mut scan = self.inner.scan.lock().await;
        if !scan.scanning {
            return;
        }
        if let Some(token) = scan.fallback.take() {
            token.cancel();
        }
        if let Err(e) = self.inner.central.stop_scan().await {
            warn!(error = %e, "BLE stop_scan failed");
        }
        scan.scanning = false;
        self.inner.scanning.store(false, Ordering::SeqCst);
        info!("BLE scan stopped");
    }

    async fn connect(&self, id: &DeviceId) -> bool {
        if self.inner.connected.contains_key(id) {
            return true;
        }
        let Some(peripheral) = self.inner.discovered.get(id).map(|p| p.clone()) else {
            warn!(device_id = %id, "connect requested for undiscovered BLE device");
            return false;
        };
        let central = &self.inner.central;
        let address = peripheral.address.as_str();

        let handshake = async {
            let characteristics = central.connect(address).await?;
            let mut subscribed = 0_usize;
            for characteristic in gatt::MEASUREMENT_CHARACTERISTICS
                .into_iter()
                .filter(|c| characteristics.contains(c))
            {
                match central.subscribe(address, characteristic).await {
                    Ok(()) => subscribed += 1,
                    Err(e) => {
                        warn!(device_id = %id, %characteristic, error = %e, "subscribe failed");
                    }
                }
            }
            Ok::<_, Error>(subscribed)
        };

        let failure = match tokio::time::timeout(self.inner.config.handshake_timeout, handshake)
            .await
        {
            Ok(Ok(subscribed)) if subscribed > 0 => None,
            Ok(Ok(_)) => Some("no measurement characteristics".to_owned()),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "handshake timed out after {}s",
                self.inner.config.handshake_timeout.as_secs()
            )),
        };
        if let Some(reason) = failure {
            warn!(device_id = %id, %reason, "BLE connect failed");
            if let Err(e) = central.disconnect(address).await {
                debug!(device_id = %id, error = %e, "cleanup disconnect failed");
            }
            return false;
        }

        let mut device = peripheral.device.clone();
        match central.read_rssi(address).await {
            Ok(rssi) => device.signal_strength = signal_strength(rssi),
            Err(e) => debug!(device_id = %id, error = %e, "RSSI read failed"),
        }

        self.inner.connected.insert(
            id.clone(),
            Peripheral {
                address: peripheral.address.clone(),
                device: device.clone(),
            },
        );
        info!(device_id = %id, name = %device.name, "BLE device connected");
        self.inner.emit(AdapterEvent::Connected(device)).await;
        true
    }

    async fn disconnect(&self, id: &DeviceId) -> bool {
        let Some((_, peripheral)) = self.inner.connected.remove(id) else {
            return false;
        };
        let result = self.inner.central.disconnect(&peripheral.address).await;
        info!(device_id = %id, "BLE device disconnected");
        self.inner.emit(AdapterEvent::Disconnected(id.clone())).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(device_id = %id, error = %e, "BLE disconnect reported an error");
                false
            }
        }
    }

    async fn close(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop().await;

        let ids: Vec<DeviceId> = self.inner.connected.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id).await;
        }

        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.event_loop.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.central.release().await;
        info!("BLE adapter shut down");
    }
}

impl RadioAdapter for BleAdapter {
    fn transport(&self) -> Transport {
        Transport::Ble
    }

    fn start_scanning(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.start())
    }

    fn stop_scanning(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop())
    }

    fn connect_device<'a>(&'a self, id: &'a DeviceId) -> BoxFuture<'a, bool> {
        Box::pin(self.connect(id))
    }

    fn disconnect_device<'a>(&'a self, id: &'a DeviceId) -> BoxFuture<'a, bool> {
        Box::pin(self.disconnect(id))
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<AdapterEvent>> {
        self.inner.event_rx.try_lock().ok().and_then(|mut rx| rx.take())
    }

    fn decode_errors(&self) -> u64 {
        self.inner.decode_errors.load(Ordering::Relaxed)
    }
}

impl BleInner {
    async fn emit(&self, event: AdapterEvent) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            sent = self.event_tx.send(event) => {
                if sent.is_err() {
                    debug!("BLE adapter event receiver dropped");
                }
            }
        }
    }

    async fn handle_advertisement(&self, adv: Advertisement) {
        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        if adv.local_name.is_none() && adv.services.is_empty() {
            return;
        }
        let id = DeviceId::new(Transport::Ble, &adv.address);
        if self.connected.contains_key(&id) || self.discovered.contains_key(&id) {
            return;
        }

        let class = classify(adv.local_name.as_deref(), &adv.services, adv.manufacturer_id);
        let device = DiscoveredDevice {
            id: id.clone(),
            name: adv
                .local_name
                .clone()
                .unwrap_or_else(|| format!("Unknown {}", adv.address)),
            kind: class.kind,
            transport: Transport::Ble,
            signal_strength: adv.rssi.map_or(0, signal_strength),
            manufacturer: class.manufacturer,
            relevance_score: class.score,
        };
        debug!(
            device_id = %id,
            name = %device.name,
            kind = %device.kind,
            score = device.relevance_score,
            "BLE device discovered"
        );
        self.discovered.insert(
            id,
            Peripheral {
                address: adv.address,
                device: device.clone(),
            },
        );
        self.emit(AdapterEvent::Discovered(device)).await;
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn ble_event_loop(
    inner: Arc<BleInner>,
    mut rx: mpsc::Receiver<BleEvent>,
    cancel: CancellationToken,
) {
    let mut decoder = FrameDecoder::new(inner.config.wheel_circumference_m);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else {
                    debug!("BLE central event stream closed");
                    break;
                };
                match event {
                    BleEvent::Advertisement(adv) => inner.handle_advertisement(adv).await,
                    BleEvent::Notification { address, characteristic, value } => {
                        let id = DeviceId::new(Transport::Ble, &address);
                        if !inner.connected.contains_key(&id) {
                            continue;
                        }
                        match decoder.decode(&id, characteristic, &value) {
                            Ok(readings) => {
                                for reading in readings {
                                    inner.emit(AdapterEvent::Reading(reading)).await;
                                }
                            }
                            Err(e) => {
                                inner.decode_errors.fetch_add(1, Ordering::Relaxed);
                                debug!(device_id = %id, error = %e, "dropping undecodable frame");
                            }
                        }
                    }
                    BleEvent::PeripheralDisconnected { address } => {
                        let id = DeviceId::new(Transport::Ble, &address);
                        decoder.forget(&id);
                        if inner.connected.remove(&id).is_some() {
                            info!(device_id = %id, "BLE link lost");
                            inner.emit(AdapterEvent::Disconnected(id)).await;
                        }
                    }
                }
            }
        }
    }
}

/// Widen a filtered scan once if nothing turned up in the grace window.
async fn fallback_scan_task(inner: Arc<BleInner>, token: CancellationToken) {
    tokio::select! {
        biased;
        () = token.cancelled() => return,
        () = tokio::time::sleep(inner.config.fallback_grace) => {}
    }

    let scan = inner.scan.lock().await;
    if token.is_cancelled() || !scan.scanning || !inner.discovered.is_empty() {
        return;
    }

    info!(
        grace_secs = inner.config.fallback_grace.as_secs(),
        "no cycling sensors advertised, widening BLE scan"
    );
    if let Err(e) = inner.central.stop_scan().await {
        debug!(error = %e, "stop before unfiltered scan failed");
    }
    if let Err(e) = inner.central.start_scan(ScanFilter::any()).await {
        warn!(error = %e, "unfiltered BLE scan failed");
        let reason = e
            .unavailable_reason()
            .unwrap_or(RadioUnavailable::Unsupported);
        drop(scan);
        inner
            .emit(AdapterEvent::Unavailable {
                transport: Transport::Ble,
                reason,
            })
            .await;
    }
}
