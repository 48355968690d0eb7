// ── Broadcast (ANT+) adapter ──
//
// ANT+ sensors broadcast continuously; there is no handshake. The adapter
// opens one channel per profile, reports new masters while scanning, and
// forwards readings only for devices the caller marked connected.

pub mod decode;
pub mod profile;
pub mod wire;

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
use crate::error::{DecodeError, Error, RadioUnavailable};
use crate::hal::{AntEvent, AntStick, ChannelMode};
use crate::revolution::DEFAULT_WHEEL_CIRCUMFERENCE_M;
use crate::types::{AdapterEvent, DeviceId, DiscoveredDevice, Transport, signal_strength};

use self::decode::AntDecoder;
use self::profile::AntProfile;

/// Tunables for the ANT+ adapter.
#[derive(Debug, Clone)]
pub struct AntConfig {
    /// How long the stick may take to report ready after `open`.
    pub ready_timeout: Duration,
    pub wheel_circumference_m: f64,
}

impl Default for AntConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            wheel_circumference_m: DEFAULT_WHEEL_CIRCUMFERENCE_M,
        }
    }
}

// ── AntAdapter ───────────────────────────────────────────────────

/// ANT+ transport adapter. Cheaply cloneable.
#[derive(Clone)]
pub struct AntAdapter {
    inner: Arc<AntInner>,
}

struct AntInner {
    config: AntConfig,
    stick: Arc<dyn AntStick>,
    event_tx: mpsc::Sender<AdapterEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<AdapterEvent>>>,
    /// Held here until the stick reports ready, then moved to the event loop.
    stick_events: Mutex<Option<mpsc::Receiver<AntEvent>>>,
    /// Serializes initialization.
    initialized: Mutex<bool>,
    channels: DashMap<u8, AntProfile>,
    scanning: AtomicBool,
    discovered: DashMap<DeviceId, DiscoveredDevice>,
    connected: DashMap<DeviceId, DiscoveredDevice>,
    /// Tells the event loop to drop per-device decoder state.
    forget_tx: mpsc::UnboundedSender<DeviceId>,
    forget_rx: Mutex<Option<mpsc::UnboundedReceiver<DeviceId>>>,
    decode_errors: AtomicU64,
    cancel: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AntAdapter {
    pub fn new(stick: Arc<dyn AntStick>, config: AntConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(ADAPTER_EVENT_BUFFER);
        let (forget_tx, forget_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(AntInner {
                config,
                stick,
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                stick_events: Mutex::new(None),
                initialized: Mutex::new(false),
                channels: DashMap::new(),
                scanning: AtomicBool::new(false),
                discovered: DashMap::new(),
                connected: DashMap::new(),
                forget_tx,
                forget_rx: Mutex::new(Some(forget_rx)),
                decode_errors: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                event_loop: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Open the stick, wait for it to report ready, open channels, and
    /// spawn the event loop.
    async fn initialize(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let mut slot = inner.stick_events.lock().await;
        if slot.is_none() {
            *slot = inner.stick.take_events();
        }
        let Some(rx) = slot.as_mut() else {
            return Err(Error::unavailable(
                Transport::Ant,
                RadioUnavailable::NoRadioPresent,
            ));
        };

        inner.stick.open().await?;
        match tokio::time::timeout(inner.config.ready_timeout, wait_for_startup(rx)).await {
            Ok(true) => debug!("ANT+ stick ready"),
            Ok(false) | Err(_) => {
                warn!(
                    timeout_secs = inner.config.ready_timeout.as_secs(),
                    "ANT+ stick did not report ready"
                );
                return Err(Error::unavailable(
                    Transport::Ant,
                    RadioUnavailable::NoRadioPresent,
                ));
            }
        }

        for (number, profile) in (0_u8..).zip(AntProfile::ALL) {
            let params = profile.channel_params();
            let opened = match inner.stick.open_channel(number, params, ChannelMode::Scan).await {
                Err(e) if e.unavailable_reason() == Some(RadioUnavailable::Unsupported) => {
                    debug!(channel = number, "scan mode unsupported, attaching");
                    inner
                        .stick
                        .open_channel(number, params, ChannelMode::Attach)
                        .await
                }
                other => other,
            };
            match opened {
                Ok(()) => {
                    inner.channels.insert(number, profile);
                }
                Err(e) => warn!(channel = number, ?profile, error = %e, "ANT+ channel open failed"),
            }
        }
        if inner.channels.is_empty() {
            return Err(Error::unavailable(
                Transport::Ant,
                RadioUnavailable::Unsupported,
            ));
        }

        let rx = slot.take().ok_or(Error::unavailable(
            Transport::Ant,
            RadioUnavailable::NoRadioPresent,
        ))?;
        let forget_rx = inner.forget_rx.lock().await.take().ok_or(Error::Operation {
            transport: Transport::Ant,
            message: "event loop already started".into(),
        })?;
        let handle = tokio::spawn(ant_event_loop(
            Arc::clone(inner),
            rx,
            forget_rx,
            inner.cancel.clone(),
        ));
        *inner.event_loop.lock().await = Some(handle);

        info!(channels = inner.channels.len(), "ANT+ stick initialized");
        Ok(())
    }

    async fn start(&self) -> Result<(), Error> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Operation {
                transport: Transport::Ant,
                message: "adapter is shut down".into(),
            });
        }

        {
            let mut initialized = self.inner.initialized.lock().await;
            if !*initialized {
                self.initialize().await?;
                *initialized = true;
            }
        }

        if self.inner.scanning.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.discovered.clear();
        self.inner.scanning.store(true, Ordering::SeqCst);
        info!("ANT+ scan started");
        Ok(())
    }

    fn stop(&self) {
        if self.inner.scanning.swap(false, Ordering::SeqCst) {
            info!("ANT+ scan stopped");
        }
    }

    async fn connect(&self, id: &DeviceId) -> bool {
        if self.inner.connected.contains_key(id) {
            return true;
        }
        let Some(device) = self.inner.discovered.get(id).map(|d| d.clone()) else {
            warn!(device_id = %id, "connect requested for undiscovered ANT+ device");
            return false;
        };
        self.inner.connected.insert(id.clone(), device.clone());
        info!(device_id = %id, "ANT+ device marked connected");
        self.inner.emit(AdapterEvent::Connected(device)).await;
        true
    }

    async fn disconnect(&self, id: &DeviceId) -> bool {
        if self.inner.connected.remove(id).is_none() {
            return false;
        }
        let _ = self.inner.forget_tx.send(id.clone());
        info!(device_id = %id, "ANT+ device marked disconnected");
        self.inner.emit(AdapterEvent::Disconnected(id.clone())).await;
        true
    }

    async fn close(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();

        let ids: Vec<DeviceId> = self.inner.connected.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id).await;
        }

        let channels: Vec<u8> = self.inner.channels.iter().map(|e| *e.key()).collect();
        for channel in channels {
            if let Err(e) = self.inner.stick.close_channel(channel).await {
                debug!(channel, error = %e, "ANT+ channel close failed");
            }
        }
        self.inner.channels.clear();

        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.event_loop.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.stick.release().await;
        info!("ANT+ adapter shut down");
    }
}

impl RadioAdapter for AntAdapter {
    fn transport(&self) -> Transport {
        Transport::Ant
    }

    fn start_scanning(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.start())
    }

    fn stop_scanning(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.stop() })
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

impl AntInner {
    async fn emit(&self, event: AdapterEvent) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            sent = self.event_tx.send(event) => {
                if sent.is_err() {
                    debug!("ANT+ adapter event receiver dropped");
                }
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn wait_for_startup(rx: &mut mpsc::Receiver<AntEvent>) -> bool {
    while let Some(event) = rx.recv().await {
        if event == AntEvent::Startup {
            return true;
        }
    }
    false
}

async fn ant_event_loop(
    inner: Arc<AntInner>,
    mut rx: mpsc::Receiver<AntEvent>,
    mut forget_rx: mpsc::UnboundedReceiver<DeviceId>,
    cancel: CancellationToken,
) {
    let mut decoder = AntDecoder::new(inner.config.wheel_circumference_m);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(id) = forget_rx.recv() => decoder.forget(&id),
            event = rx.recv() => {
                let Some(event) = event else {
                    warn!("ANT+ stick event stream closed");
                    inner.emit(AdapterEvent::Unavailable {
                        transport: Transport::Ant,
                        reason: RadioUnavailable::NoRadioPresent,
                    }).await;
                    break;
                };
                match event {
                    AntEvent::Broadcast { device_number, device_type, rssi, payload, .. } => {
                        let Some(profile) = AntProfile::from_device_type(device_type) else {
                            inner.decode_errors.fetch_add(1, Ordering::Relaxed);
                            debug!(error = %DecodeError::UnknownDeviceType(device_type), "dropping broadcast");
                            continue;
                        };
                        let id = profile.device_id(device_number);

                        if inner.scanning.load(Ordering::SeqCst)
                            && !inner.discovered.contains_key(&id)
                            && !inner.connected.contains_key(&id)
                        {
                            let device = DiscoveredDevice {
                                id: id.clone(),
                                name: profile.display_name(device_number),
                                kind: profile.sensor_kind(),
                                transport: Transport::Ant,
                                signal_strength: rssi.map_or(0, signal_strength),
                                manufacturer: None,
                                relevance_score: 100,
                            };
                            debug!(device_id = %id, "ANT+ device discovered");
                            inner.discovered.insert(id.clone(), device.clone());
                            inner.emit(AdapterEvent::Discovered(device)).await;
                        }

                        if inner.connected.contains_key(&id) {
                            for reading in decoder.decode(&id, profile, &payload) {
                                inner.emit(AdapterEvent::Reading(reading)).await;
                            }
                        }
                    }
                    AntEvent::ChannelClosed { channel } => {
                        warn!(channel, "ANT+ channel closed by stick");
                        inner.channels.remove(&channel);
                    }
                    AntEvent::Startup => debug!("ANT+ stick reset"),
                }
            }
        }
    }
}
