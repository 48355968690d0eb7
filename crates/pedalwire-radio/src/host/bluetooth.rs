// ── BLE central over btleplug ──
//
// Wraps the first host Bluetooth adapter btleplug reports (BlueZ on
// Linux, CoreBluetooth on macOS, WinRT on Windows). The adapter is
// acquired on the first scan, so building a `HostCentral` never touches
// the radio.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use btleplug::api::{
    Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter as HostScanFilter,
    ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, RadioUnavailable};
use crate::hal::{Advertisement, BleCentral, BleEvent, ScanFilter};
use crate::types::Transport;

const EVENT_BUFFER: usize = 256;

type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// The manager has to outlive the adapter on some platforms.
struct Host {
    _manager: Manager,
    adapter: Adapter,
}

struct Shared {
    tx: mpsc::Sender<BleEvent>,
    /// Peripherals seen in advertisements, by printed address.
    peripherals: DashMap<String, Peripheral>,
    filter: StdMutex<ScanFilter>,
    /// Notification forwarders of connected peripherals.
    notifiers: DashMap<String, JoinHandle<()>>,
}

impl Shared {
    async fn advertisement(&self, adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
        let peripheral = adapter.peripheral(id).await.ok()?;
        let props = peripheral.properties().await.ok().flatten()?;
        // BlueZ replays cached devices regardless of the service filter.
        let wanted = self
            .filter
            .lock()
            .map_or(true, |filter| filter.matches(&props.services));
        if !wanted {
            return None;
        }
        let address = props.address.to_string();
        self.peripherals.insert(address.clone(), peripheral);
        Some(Advertisement {
            address,
            local_name: props.local_name,
            rssi: props.rssi,
            services: props.services,
            manufacturer_id: props.manufacturer_data.keys().min().copied(),
        })
    }

    fn stop_notifier(&self, address: &str) {
        if let Some((_, notifier)) = self.notifiers.remove(address) {
            notifier.abort();
        }
    }
}

/// BLE central role on the host's Bluetooth adapter.
pub struct HostCentral {
    shared: Arc<Shared>,
    host: OnceCell<Host>,
    events: StdMutex<Option<mpsc::Receiver<BleEvent>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl HostCentral {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                tx,
                peripherals: DashMap::new(),
                filter: StdMutex::new(ScanFilter::any()),
                notifiers: DashMap::new(),
            }),
            host: OnceCell::new(),
            events: StdMutex::new(Some(rx)),
            pump: StdMutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn adapter(&self) -> Result<&Adapter, Error> {
        let host = self
            .host
            .get_or_try_init(|| async {
                let manager = Manager::new().await.map_err(|e| acquisition_error(&e))?;
                let adapter = manager
                    .adapters()
                    .await
                    .map_err(|e| acquisition_error(&e))?
                    .into_iter()
                    .next()
                    .ok_or(Error::unavailable(
                        Transport::Ble,
                        RadioUnavailable::NoRadioPresent,
                    ))?;
                let events = adapter.events().await.map_err(|e| acquisition_error(&e))?;
                let pump = tokio::spawn(pump_events(
                    adapter.clone(),
                    events,
                    Arc::clone(&self.shared),
                    self.cancel.clone(),
                ));
                if let Ok(mut slot) = self.pump.lock() {
                    *slot = Some(pump);
                }
                let name = adapter.adapter_info().await.unwrap_or_default();
                info!(adapter = %name, "Bluetooth adapter acquired");
                Ok::<_, Error>(Host {
                    _manager: manager,
                    adapter,
                })
            })
            .await?;
        Ok(&host.adapter)
    }

    fn peripheral(&self, address: &str) -> Result<Peripheral, Error> {
        self.shared
            .peripherals
            .get(address)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::UnknownPeripheral(address.to_owned()))
    }
}

impl Default for HostCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl BleCentral for HostCentral {
    fn start_scan(&self, filter: ScanFilter) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let services = filter.services.clone();
            if let Ok(mut slot) = self.shared.filter.lock() {
                *slot = filter;
            }
            let adapter = self.adapter().await?;
            adapter
                .start_scan(HostScanFilter { services })
                .await
                .map_err(|e| classify(&e))
        })
    }

    fn stop_scan(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            match self.host.get() {
                Some(host) => host.adapter.stop_scan().await.map_err(|e| classify(&e)),
                None => Ok(()),
            }
        })
    }

    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Vec<Uuid>, Error>> {
        Box::pin(async move {
            let peripheral = self.peripheral(address)?;
            if !peripheral.is_connected().await.unwrap_or(false) {
                peripheral.connect().await.map_err(|e| classify(&e))?;
            }
            peripheral
                .discover_services()
                .await
                .map_err(|e| classify(&e))?;

            let notifications = peripheral.notifications().await.map_err(|e| classify(&e))?;
            let forwarder = tokio::spawn(forward_notifications(
                address.to_owned(),
                notifications,
                self.shared.tx.clone(),
                self.cancel.clone(),
            ));
            if let Some(stale) = self.shared.notifiers.insert(address.to_owned(), forwarder) {
                stale.abort();
            }

            Ok(peripheral
                .characteristics()
                .into_iter()
                .map(|c| c.uuid)
                .collect())
        })
    }

    fn subscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Uuid,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let peripheral = self.peripheral(address)?;
            let target = peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == characteristic)
                .ok_or_else(|| Error::Operation {
                    transport: Transport::Ble,
                    message: format!("{address} has no characteristic {characteristic}"),
                })?;
            peripheral.subscribe(&target).await.map_err(|e| classify(&e))
        })
    }

    fn read_rssi<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<i16, Error>> {
        Box::pin(async move {
            let peripheral = self.peripheral(address)?;
            peripheral
                .properties()
                .await
                .map_err(|e| classify(&e))?
                .and_then(|props| props.rssi)
                .ok_or_else(|| Error::Operation {
                    transport: Transport::Ble,
                    message: format!("{address} reported no signal strength"),
                })
        })
    }

    fn disconnect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.shared.stop_notifier(address);
            match self.shared.peripherals.get(address).map(|p| p.value().clone()) {
                Some(peripheral) => peripheral.disconnect().await.map_err(|e| classify(&e)),
                None => Ok(()),
            }
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<BleEvent>> {
        self.events.lock().ok().and_then(|mut rx| rx.take())
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(host) = self.host.get() {
                if let Err(e) = host.adapter.stop_scan().await {
                    debug!(error = %e, "stop scan on release");
                }
            }
            self.cancel.cancel();
            let pump = self.pump.lock().ok().and_then(|mut slot| slot.take());
            if let Some(pump) = pump {
                let _ = pump.await;
            }
            let addresses: Vec<String> = self
                .shared
                .notifiers
                .iter()
                .map(|entry| entry.key().clone())
                .collect();
            for address in &addresses {
                self.shared.stop_notifier(address);
            }
        })
    }
}

// ── Event forwarding ────────────────────────────────────────────────

async fn pump_events(
    adapter: Adapter,
    mut events: EventStream<CentralEvent>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else {
            debug!("Bluetooth event stream ended");
            break;
        };
        let forwarded = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => shared
                .advertisement(&adapter, &id)
                .await
                .map(BleEvent::Advertisement),
            CentralEvent::DeviceDisconnected(id) => match adapter.peripheral(&id).await {
                Ok(peripheral) => {
                    let address = peripheral.address().to_string();
                    shared.stop_notifier(&address);
                    Some(BleEvent::PeripheralDisconnected { address })
                }
                Err(_) => None,
            },
            _ => None,
        };
        if let Some(event) = forwarded {
            if shared.tx.send(event).await.is_err() {
                break;
            }
        }
    }
}

async fn forward_notifications(
    address: String,
    mut notifications: EventStream<ValueNotification>,
    tx: mpsc::Sender<BleEvent>,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            n = notifications.next() => n,
        };
        let Some(ValueNotification { uuid, value, .. }) = notification else {
            break;
        };
        let event = BleEvent::Notification {
            address: address.clone(),
            characteristic: uuid,
            value,
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

// ── Error mapping ───────────────────────────────────────────────────

fn classify(err: &btleplug::Error) -> Error {
    let reason = match err {
        btleplug::Error::PermissionDenied => RadioUnavailable::PermissionDenied,
        btleplug::Error::NotSupported(_) => RadioUnavailable::Unsupported,
        btleplug::Error::TimedOut(_) => RadioUnavailable::Timeout,
        btleplug::Error::DeviceNotFound => return Error::UnknownPeripheral(err.to_string()),
        _ => {
            return Error::Operation {
                transport: Transport::Ble,
                message: err.to_string(),
            };
        }
    };
    Error::unavailable(Transport::Ble, reason)
}

/// Acquisition failures other than a refusal mean there is no usable
/// adapter (no D-Bus, no BlueZ, no controller).
fn acquisition_error(err: &btleplug::Error) -> Error {
    match classify(err) {
        unavailable @ Error::Unavailable { .. } => unavailable,
        _ => {
            debug!(error = %err, "no usable Bluetooth adapter");
            Error::unavailable(Transport::Ble, RadioUnavailable::NoRadioPresent)
        }
    }
}
