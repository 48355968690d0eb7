// ── Loopback hardware ──
//
// In-process implementations of the capability traits. They drive the
// adapters in tests and behind `--simulate`, with no radio attached.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::error::{Error, RadioUnavailable};
use crate::hal::{
    Advertisement, AntEvent, AntStick, BleCentral, BleEvent, ChannelMode, ChannelParams,
    PermissionProbe, ScanFilter,
};
use crate::types::{RadioStatus, Transport};

const LOOPBACK_EVENT_BUFFER: usize = 1024;

// ── Probe ────────────────────────────────────────────────────────

/// Always returns the status it was built with.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub RadioStatus);

impl StaticProbe {
    pub fn ready() -> Self {
        Self(RadioStatus::Ready)
    }
}

impl PermissionProbe for StaticProbe {
    fn probe(&self) -> BoxFuture<'_, RadioStatus> {
        let status = self.0;
        Box::pin(async move { status })
    }
}

// ── BLE central ──────────────────────────────────────────────────

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct LoopbackPeripheral {
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub characteristics: Vec<Uuid>,
    pub rssi: i16,
    pub manufacturer_id: Option<u16>,
    /// When false, `connect` fails.
    pub connectable: bool,
    /// When true, `connect` never completes.
    pub hangs_on_connect: bool,
}

impl LoopbackPeripheral {
    pub fn new(address: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            name: name.map(str::to_owned),
            services: Vec::new(),
            characteristics: Vec::new(),
            rssi: -60,
            manufacturer_id: None,
            connectable: true,
            hangs_on_connect: false,
        }
    }

    pub fn with_service(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.services.push(service);
        self.characteristics.push(characteristic);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            address: self.address.clone(),
            local_name: self.name.clone(),
            rssi: Some(self.rssi),
            services: self.services.clone(),
            manufacturer_id: self.manufacturer_id,
        }
    }
}

/// In-memory BLE central.
pub struct LoopbackCentral {
    tx: mpsc::Sender<BleEvent>,
    rx: Mutex<Option<mpsc::Receiver<BleEvent>>>,
    peripherals: DashMap<String, LoopbackPeripheral>,
    subscriptions: DashMap<String, Vec<Uuid>>,
    scan: Mutex<Option<ScanFilter>>,
    scan_history: Mutex<Vec<ScanFilter>>,
    unavailable: Mutex<Option<RadioUnavailable>>,
    released: AtomicBool,
}

impl Default for LoopbackCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackCentral {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(LOOPBACK_EVENT_BUFFER);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            peripherals: DashMap::new(),
            subscriptions: DashMap::new(),
            scan: Mutex::new(None),
            scan_history: Mutex::new(Vec::new()),
            unavailable: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next scans fail with `reason`.
    pub async fn set_unavailable(&self, reason: Option<RadioUnavailable>) {
        *self.unavailable.lock().await = reason;
    }

    /// Register a peripheral. It advertises immediately if a matching
    /// scan is running.
    pub async fn add_peripheral(&self, peripheral: LoopbackPeripheral) {
        let advertise = self
            .scan
            .lock()
            .await
            .as_ref()
            .is_some_and(|f| f.matches(&peripheral.services));
        let adv = peripheral.advertisement();
        self.peripherals.insert(peripheral.address.clone(), peripheral);
        if advertise {
            let _ = self.tx.send(BleEvent::Advertisement(adv)).await;
        }
    }

    /// Deliver a notification if the characteristic is subscribed.
    pub async fn notify(&self, address: &str, characteristic: Uuid, value: &[u8]) -> bool {
        let subscribed = self
            .subscriptions
            .get(address)
            .is_some_and(|s| s.contains(&characteristic));
        if subscribed {
            let _ = self
                .tx
                .send(BleEvent::Notification {
                    address: address.to_owned(),
                    characteristic,
                    value: value.to_vec(),
                })
                .await;
        }
        subscribed
    }

    /// Simulate the peripheral dropping the link.
    pub async fn drop_link(&self, address: &str) {
        if self.subscriptions.remove(address).is_some() {
            let _ = self
                .tx
                .send(BleEvent::PeripheralDisconnected {
                    address: address.to_owned(),
                })
                .await;
        }
    }

    /// Every filter `start_scan` was called with, oldest first.
    pub async fn scan_history(&self) -> Vec<ScanFilter> {
        self.scan_history.lock().await.clone()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.subscriptions.contains_key(address)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn unknown(address: &str) -> Error {
        Error::UnknownPeripheral(address.to_owned())
    }
}

impl BleCentral for LoopbackCentral {
    fn start_scan(&self, filter: ScanFilter) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if let Some(reason) = *self.unavailable.lock().await {
                return Err(Error::unavailable(Transport::Ble, reason));
            }
            self.scan_history.lock().await.push(filter.clone());
            let matching: Vec<Advertisement> = self
                .peripherals
                .iter()
                .filter(|p| filter.matches(&p.services))
                .map(|p| p.advertisement())
                .collect();
            *self.scan.lock().await = Some(filter);
            for adv in matching {
                let _ = self.tx.send(BleEvent::Advertisement(adv)).await;
            }
            Ok(())
        })
    }

    fn stop_scan(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            *self.scan.lock().await = None;
            Ok(())
        })
    }

    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Vec<Uuid>, Error>> {
        Box::pin(async move {
            let peripheral = self
                .peripherals
                .get(address)
                .map(|p| p.clone())
                .ok_or_else(|| Self::unknown(address))?;
            if peripheral.hangs_on_connect {
                std::future::pending::<()>().await;
            }
            if !peripheral.connectable {
                return Err(Error::Operation {
                    transport: Transport::Ble,
                    message: format!("{address} refused the connection"),
                });
            }
            self.subscriptions.insert(address.to_owned(), Vec::new());
            Ok(peripheral.characteristics)
        })
    }

    fn subscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Uuid,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut subs = self
                .subscriptions
                .get_mut(address)
                .ok_or_else(|| Self::unknown(address))?;
            subs.push(characteristic);
            Ok(())
        })
    }

    fn read_rssi<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<i16, Error>> {
        Box::pin(async move {
            self.peripherals
                .get(address)
                .map(|p| p.rssi)
                .ok_or_else(|| Self::unknown(address))
        })
    }

    fn disconnect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.subscriptions.remove(address);
            Ok(())
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<BleEvent>> {
        self.rx.try_lock().ok().and_then(|mut rx| rx.take())
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.released.store(true, Ordering::SeqCst);
        })
    }
}

// ── ANT+ stick ───────────────────────────────────────────────────

/// In-memory ANT+ stick.
pub struct LoopbackAntStick {
    tx: mpsc::Sender<AntEvent>,
    rx: Mutex<Option<mpsc::Receiver<AntEvent>>>,
    /// Emit `Startup` when opened.
    responsive: bool,
    /// Reject `ChannelMode::Scan` as unsupported.
    attach_only: bool,
    channels: DashMap<u8, (ChannelParams, ChannelMode)>,
    opens: AtomicUsize,
    released: AtomicBool,
}

impl LoopbackAntStick {
    pub fn new() -> Self {
        Self::build(true, false)
    }

    /// A stick that never reports ready.
    pub fn silent() -> Self {
        Self::build(false, false)
    }

    /// A stick without background scanning support.
    pub fn attach_only() -> Self {
        Self::build(true, true)
    }

    fn build(responsive: bool, attach_only: bool) -> Self {
        let (tx, rx) = mpsc::channel(LOOPBACK_EVENT_BUFFER);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            responsive,
            attach_only,
            channels: DashMap::new(),
            opens: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Broadcast a payload from a master. Delivered only if a channel for
    /// `device_type` is open.
    pub async fn broadcast(&self, device_type: u8, device_number: u16, payload: [u8; 8]) -> bool {
        let channel = self
            .channels
            .iter()
            .find(|c| c.value().0.device_type == device_type)
            .map(|c| *c.key());
        let Some(channel) = channel else {
            return false;
        };
        let _ = self
            .tx
            .send(AntEvent::Broadcast {
                channel,
                device_number,
                device_type,
                transmission_type: 1,
                rssi: Some(-55),
                payload,
            })
            .await;
        true
    }

    pub fn channel_mode(&self, channel: u8) -> Option<ChannelMode> {
        self.channels.get(&channel).map(|c| c.value().1)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackAntStick {
    fn default() -> Self {
        Self::new()
    }
}

impl AntStick for LoopbackAntStick {
    fn open(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.responsive {
                let _ = self.tx.send(AntEvent::Startup).await;
            }
            Ok(())
        })
    }

    fn open_channel(
        &self,
        channel: u8,
        params: ChannelParams,
        mode: ChannelMode,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if self.attach_only && mode == ChannelMode::Scan {
                return Err(Error::unavailable(
                    Transport::Ant,
                    RadioUnavailable::Unsupported,
                ));
            }
            self.channels.insert(channel, (params, mode));
            Ok(())
        })
    }

    fn close_channel(&self, channel: u8) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.channels.remove(&channel);
            Ok(())
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<AntEvent>> {
        self.rx.try_lock().ok().and_then(|mut rx| rx.take())
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.released.store(true, Ordering::SeqCst);
        })
    }
}
