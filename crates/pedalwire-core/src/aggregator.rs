// ── Aggregator ──
//
// Unifies the radio adapters behind one device registry and one event
// stream. Adapter events are merged onto a single channel and applied by
// one task; control calls route to the owning adapter by transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pedalwire_radio::{AdapterEvent, Measurement, RadioAdapter, RadioUnavailable, Transport};

use crate::command::{Command, CommandResult, ScanReport, StatusReport, TransportReport};
use crate::config::AggregatorConfig;
use crate::error::CoreError;
use crate::model::{ConnectionState, Device, DeviceId, Session, UnifiedEvent};
use crate::persistence::ReadingStore;
use crate::session::SessionTracker;
use crate::store::DeviceRegistry;
use crate::stream::EntityStream;

const MERGED_EVENT_BUFFER: usize = 512;

/// Last known availability of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Availability {
    Unknown,
    Available,
    Unavailable(Option<RadioUnavailable>),
}

// ── Aggregator ───────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<AggregatorInner>`. Owns the adapters, the
/// device registry and the session tracker; publishes every change on a
/// broadcast channel of [`UnifiedEvent`]s.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    config: AggregatorConfig,
    adapters: Vec<Arc<dyn RadioAdapter>>,
    registry: DeviceRegistry,
    sessions: SessionTracker,
    store: Arc<dyn ReadingStore>,
    event_tx: broadcast::Sender<Arc<UnifiedEvent>>,
    availability: DashMap<Transport, Availability>,
    /// Cancels the pending auto-stop of the current scan.
    scan_timer: Mutex<Option<CancellationToken>>,
    started: Mutex<bool>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Aggregator {
    /// Build an aggregator over `adapters`. Does not start anything; the
    /// first scan (or [`start`](Self::start)) spawns the event pipeline.
    pub fn new(
        config: AggregatorConfig,
        adapters: Vec<Arc<dyn RadioAdapter>>,
        store: Arc<dyn ReadingStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let sessions = SessionTracker::new(config.session_policy, Arc::clone(&store), event_tx.clone());
        let availability = adapters
            .iter()
            .map(|a| (a.transport(), Availability::Unknown))
            .collect();

        Self {
            inner: Arc::new(AggregatorInner {
                config,
                adapters,
                registry: DeviceRegistry::new(),
                sessions,
                store,
                event_tx,
                availability,
                scan_timer: Mutex::new(None),
                started: Mutex::new(false),
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.inner.sessions
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Take every adapter's event receiver and spawn the pipeline that
    /// applies them. Idempotent.
    pub async fn start(&self) {
        let mut started = self.inner.started.lock().await;
        if *started {
            return;
        }
        *started = true;

        let (merged_tx, merged_rx) = mpsc::channel(MERGED_EVENT_BUFFER);
        let mut handles = self.inner.task_handles.lock().await;
        for adapter in &self.inner.adapters {
            let Some(rx) = adapter.take_events() else {
                warn!(transport = %adapter.transport(), "adapter events already taken");
                continue;
            };
            let cancel = self.inner.cancel.clone();
            handles.push(tokio::spawn(forward_task(rx, merged_tx.clone(), cancel)));
        }
        drop(merged_tx);

        let agg = self.clone();
        let cancel = self.inner.cancel.clone();
        handles.push(tokio::spawn(event_task(agg, merged_rx, cancel)));
        debug!(adapters = self.inner.adapters.len(), "aggregator pipeline started");
    }

    /// Stop scanning, disconnect every connected device in parallel, then
    /// release all adapters. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_scanning().await;

        let ids = self.inner.registry.connected_ids();
        if !ids.is_empty() {
            info!(count = ids.len(), "disconnecting devices before shutdown");
        }
        join_all(ids.iter().map(|id| self.disconnect_device(id))).await;

        join_all(self.inner.adapters.iter().map(|a| a.shutdown())).await;

        self.inner.cancel.cancel();
        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        self.inner.registry.clear();
        info!("aggregator shut down");
    }

    // ── Scanning ─────────────────────────────────────────────────

    /// Clear the discovered set and start every adapter. One transport
    /// failing never blocks the other; the call fails only when none could
    /// start. Scanning stops on its own after the configured window.
    pub async fn start_scanning(&self) -> Result<ScanReport, CoreError> {
        self.start().await;

        if !self.inner.registry.begin_scan() {
            debug!("scan already running");
            return Ok(ScanReport {
                already_scanning: true,
                transports: self.transport_reports(),
            });
        }
        self.inner.registry.clear_stale_discoveries();

        let results = join_all(self.inner.adapters.iter().map(|adapter| async move {
            (adapter.transport(), adapter.start_scanning().await)
        }))
        .await;

        let mut started = 0usize;
        let mut failures = Vec::new();
        for (transport, result) in results {
            match result {
                Ok(()) => {
                    started += 1;
                    self.set_availability(transport, Availability::Available);
                }
                Err(e) => {
                    warn!(transport = %transport, error = %e, "transport unavailable");
                    self.set_availability(transport, Availability::Unavailable(e.unavailable_reason()));
                    failures.push(format!("{}: {e}", transport.label()));
                }
            }
        }

        if started == 0 {
            self.inner.registry.end_scan();
            let message = if failures.is_empty() {
                "no radio adapters configured".to_owned()
            } else {
                failures.join("; ")
            };
            return Err(CoreError::NoTransportAvailable { message });
        }

        self.arm_scan_timer().await;
        info!(started, window_secs = self.inner.config.scan_window.as_secs(), "scanning started");
        Ok(ScanReport {
            already_scanning: false,
            transports: self.transport_reports(),
        })
    }

    /// Stop every adapter. Idempotent; does not cancel a connect in flight.
    pub async fn stop_scanning(&self) {
        if let Some(timer) = self.inner.scan_timer.lock().await.take() {
            timer.cancel();
        }
        let was_scanning = self.inner.registry.end_scan();
        join_all(self.inner.adapters.iter().map(|a| a.stop_scanning())).await;
        if was_scanning {
            info!("scanning stopped");
        }
    }

    async fn arm_scan_timer(&self) {
        let token = self.inner.cancel.child_token();
        if let Some(previous) = self.inner.scan_timer.lock().await.replace(token.clone()) {
            previous.cancel();
        }
        let agg = self.clone();
        let window = self.inner.config.scan_window;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(window) => {
                    debug!("scan window elapsed");
                    agg.stop_scanning().await;
                }
            }
        });
    }

    // ── Devices ──────────────────────────────────────────────────

    /// Connect a discovered device. `false` for an unknown id or a failed
    /// handshake.
    pub async fn connect_device(&self, id: &DeviceId) -> bool {
        match self.try_connect(id).await {
            Ok(_) => true,
            Err(e) => {
                warn!(device_id = %id, error = %e, "connect failed");
                false
            }
        }
    }

    /// Disconnect a connected device. `false` for an unknown id or an
    /// adapter-side failure; the device leaves the connected set either way.
    pub async fn disconnect_device(&self, id: &DeviceId) -> bool {
        match self.try_disconnect(id).await {
            Ok(_) => true,
            Err(e) => {
                warn!(device_id = %id, error = %e, "disconnect failed");
                false
            }
        }
    }

    async fn try_connect(&self, id: &DeviceId) -> Result<Device, CoreError> {
        let registry = &self.inner.registry;
        if let Some(device) = registry.is_connected(id).then(|| registry.lookup(id)).flatten() {
            return Ok((*device).clone());
        }
        let device = registry.lookup(id).ok_or_else(|| not_found(id))?;
        let adapter = self.adapter_for(device.transport)?;

        let connecting = registry
            .set_discovered_state(id, ConnectionState::Connecting)
            .ok_or_else(|| CoreError::InvalidRequest {
                message: format!("{id} is already {}", device.state),
            })?;
        self.publish(UnifiedEvent::status(&connecting));

        if adapter.connect_device(id).await {
            if let Some(connected) = registry.promote(&connecting) {
                info!(device_id = %id, "device connected");
                self.publish(UnifiedEvent::status(&connected));
            }
            return Ok(registry
                .lookup(id)
                .map_or_else(|| connecting.with_state(ConnectionState::Connected), |d| (*d).clone()));
        }

        if let Some(failed) = registry.set_discovered_state(id, ConnectionState::Disconnected) {
            self.publish(UnifiedEvent::status(&failed));
        }
        Err(CoreError::TransportOperationFailed {
            transport: device.transport,
            message: format!("handshake with {id} failed"),
        })
    }

    async fn try_disconnect(&self, id: &DeviceId) -> Result<Device, CoreError> {
        let registry = &self.inner.registry;
        let device = registry
            .is_connected(id)
            .then(|| registry.lookup(id))
            .flatten()
            .ok_or_else(|| not_found(id))?;
        let adapter = self.adapter_for(device.transport)?;

        if let Some(disconnecting) = registry.mark_disconnecting(id) {
            self.publish(UnifiedEvent::status(&disconnecting));
        }
        let clean = adapter.disconnect_device(id).await;

        let gone = match registry.demote(id) {
            Some(gone) => {
                info!(device_id = %id, "device disconnected");
                self.publish(UnifiedEvent::status(&gone));
                gone
            }
            None => device.with_state(ConnectionState::Disconnected),
        };
        if clean {
            Ok(gone)
        } else {
            Err(CoreError::TransportOperationFailed {
                transport: device.transport,
                message: format!("adapter reported an error disconnecting {id}"),
            })
        }
    }

    fn adapter_for(&self, transport: Transport) -> Result<&Arc<dyn RadioAdapter>, CoreError> {
        self.inner
            .adapters
            .iter()
            .find(|a| a.transport() == transport)
            .ok_or_else(|| CoreError::TransportOperationFailed {
                transport,
                message: "transport not configured".into(),
            })
    }

    // ── Command execution ────────────────────────────────────────

    /// Execute a control command and await its outcome.
    pub async fn execute(&self, cmd: Command) -> Result<CommandResult, CoreError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("aggregator is shut down".into()));
        }
        match cmd {
            Command::StartScanning => self.start_scanning().await.map(CommandResult::Scan),
            Command::StopScanning => {
                self.stop_scanning().await;
                Ok(CommandResult::Ok)
            }
            Command::ConnectDevice { id } => self.try_connect(&id).await.map(CommandResult::Device),
            Command::DisconnectDevice { id } => {
                self.try_disconnect(&id).await.map(CommandResult::Device)
            }
            Command::StartSession { name } => self
                .inner
                .sessions
                .start(name)
                .await
                .map(CommandResult::Session),
            Command::StopSession => self.inner.sessions.end().await.map(CommandResult::Session),
            Command::PauseSession => self.inner.sessions.pause().await.map(CommandResult::Session),
            Command::ResumeSession => self.inner.sessions.resume().await.map(CommandResult::Session),
            Command::GetStatus => Ok(CommandResult::Status(Box::new(self.status().await))),
        }
    }

    // ── State observation ────────────────────────────────────────

    /// Subscribe to the unified event stream.
    pub fn events(&self) -> broadcast::Receiver<Arc<UnifiedEvent>> {
        self.inner.event_tx.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.registry.is_scanning()
    }

    pub fn discovered_snapshot(&self) -> Arc<Vec<Arc<Device>>> {
        self.inner.registry.discovered_snapshot()
    }

    pub fn connected_snapshot(&self) -> Arc<Vec<Arc<Device>>> {
        self.inner.registry.connected_snapshot()
    }

    pub fn discovered(&self) -> EntityStream<Device> {
        self.inner.registry.discovered_stream()
    }

    pub fn connected(&self) -> EntityStream<Device> {
        self.inner.registry.connected_stream()
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.inner.sessions.current().await
    }

    pub async fn status(&self) -> StatusReport {
        let devices =
            |snap: Arc<Vec<Arc<Device>>>| -> Vec<Device> { snap.iter().map(|d| (**d).clone()).collect() };
        StatusReport {
            scanning: self.is_scanning(),
            transports: self.transport_reports(),
            discovered: devices(self.discovered_snapshot()),
            connected: devices(self.connected_snapshot()),
            session: self.current_session().await,
            dropped_readings: self.inner.sessions.dropped_readings(),
        }
    }

    fn transport_reports(&self) -> Vec<TransportReport> {
        self.inner
            .adapters
            .iter()
            .map(|adapter| {
                let transport = adapter.transport();
                let availability = self
                    .inner
                    .availability
                    .get(&transport)
                    .map_or(Availability::Unknown, |a| *a);
                let (available, reason) = match availability {
                    Availability::Unknown => (None, None),
                    Availability::Available => (Some(true), None),
                    Availability::Unavailable(reason) => (Some(false), reason),
                };
                TransportReport {
                    transport,
                    available,
                    reason,
                    decode_errors: adapter.decode_errors(),
                }
            })
            .collect()
    }

    // ── Internals ────────────────────────────────────────────────

    fn publish(&self, event: UnifiedEvent) {
        // No receivers is fine.
        let _ = self.inner.event_tx.send(Arc::new(event));
    }

    /// Record availability and publish it if it changed.
    fn set_availability(&self, transport: Transport, next: Availability) {
        let previous = self.inner.availability.insert(transport, next);
        if previous == Some(next) {
            return;
        }
        let (available, reason) = match next {
            Availability::Available => (true, None),
            Availability::Unavailable(reason) => (false, reason),
            Availability::Unknown => return,
        };
        self.publish(UnifiedEvent::TransportStatus {
            transport,
            available,
            reason,
        });
    }

    async fn apply(&self, event: AdapterEvent) {
        let registry = &self.inner.registry;
        match event {
            AdapterEvent::Discovered(found) => {
                if let Some(device) = registry.record_discovery(Device::from(found)) {
                    debug!(device_id = %device.id, kind = %device.kind, "device discovered");
                    self.publish(UnifiedEvent::DeviceDiscovered { device });
                }
            }
            AdapterEvent::Connected(found) => {
                let device = registry
                    .lookup(&found.id)
                    .map_or_else(|| Device::from(found), |d| (*d).clone());
                if let Some(connected) = registry.promote(&device) {
                    info!(device_id = %connected.id, "device connected");
                    self.publish(UnifiedEvent::status(&connected));
                }
            }
            AdapterEvent::Disconnected(id) => {
                if let Some(gone) = registry.demote(&id) {
                    info!(device_id = %id, "device link lost");
                    self.publish(UnifiedEvent::status(&gone));
                }
            }
            AdapterEvent::Reading(measurement) => self.record(measurement).await,
            AdapterEvent::Unavailable { transport, reason } => {
                warn!(transport = %transport, reason = %reason, "transport became unavailable");
                self.set_availability(transport, Availability::Unavailable(Some(reason)));
            }
        }
    }

    async fn record(&self, measurement: Measurement) {
        if !self.inner.registry.is_connected(&measurement.device_id) {
            debug!(device_id = %measurement.device_id, "reading from unconnected device ignored");
            return;
        }
        let Some(reading) = self.inner.sessions.attribute(measurement).await else {
            return;
        };
        if let Err(e) = self.inner.store.append_reading(&reading) {
            warn!(device_id = %reading.device_id, error = %e, "failed to persist reading");
        }
        self.publish(UnifiedEvent::SensorData { reading });
    }
}

fn not_found(id: &DeviceId) -> CoreError {
    CoreError::DeviceNotFound {
        identifier: id.to_string(),
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Copy one adapter's events onto the merged channel.
async fn forward_task(
    mut rx: mpsc::Receiver<AdapterEvent>,
    merged: mpsc::Sender<AdapterEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = merged.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// The single writer for adapter-originated registry changes.
async fn event_task(
    agg: Aggregator,
    mut rx: mpsc::Receiver<AdapterEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                agg.apply(event).await;
            }
        }
    }
    debug!("aggregator event task stopped");
}
