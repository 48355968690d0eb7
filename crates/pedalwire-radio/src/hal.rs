// ── Hardware capability traits ──
//
// The adapters never talk to a radio stack directly. They drive these
// narrow capabilities, which a platform backend (or the loopback
// simulator) implements. Every hardware event arrives on a channel the
// adapter takes exactly once.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::types::RadioStatus;

// ── Permission probe ────────────────────────────────────────────────

/// Checks whether the host allows radio use before any scan starts.
pub trait PermissionProbe: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, RadioStatus>;
}

// ── BLE central ─────────────────────────────────────────────────────

/// Which advertisements a scan should report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanFilter {
    /// Empty means "report everything".
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    pub fn services(services: &[Uuid]) -> Self {
        Self {
            services: services.to_vec(),
        }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_unfiltered(&self) -> bool {
        self.services.is_empty()
    }

    pub fn matches(&self, advertised: &[Uuid]) -> bool {
        self.is_unfiltered() || advertised.iter().any(|s| self.services.contains(s))
    }
}

/// One advertisement packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    pub manufacturer_id: Option<u16>,
}

/// Events raised by a BLE central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    Advertisement(Advertisement),
    Notification {
        address: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Link dropped, whether requested or not.
    PeripheralDisconnected { address: String },
}

/// A BLE central role: scan, connect, subscribe.
pub trait BleCentral: Send + Sync {
    fn start_scan(&self, filter: ScanFilter) -> BoxFuture<'_, Result<(), Error>>;

    fn stop_scan(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Open a link and discover services. Returns every characteristic
    /// UUID the peripheral exposes.
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Vec<Uuid>, Error>>;

    fn subscribe<'a>(
        &'a self,
        address: &'a str,
        characteristic: Uuid,
    ) -> BoxFuture<'a, Result<(), Error>>;

    fn read_rssi<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<i16, Error>>;

    fn disconnect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Hand over the event receiver. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<BleEvent>>;

    /// Release the radio. Called once during adapter shutdown.
    fn release(&self) -> BoxFuture<'_, ()>;
}

// ── ANT+ USB stick ──────────────────────────────────────────────────

/// How a channel should listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    /// Background scanning: receive every matching master in range.
    Scan,
    /// Plain wildcard slave channel that pairs with the first master.
    Attach,
}

/// Radio parameters for one ANT+ device profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelParams {
    pub device_type: u8,
    /// Message period in 1/32768 s units.
    pub period: u16,
    /// RF channel offset from 2400 MHz.
    pub rf_frequency: u8,
    /// 0 = wildcard.
    pub device_number: u16,
    /// 0 = wildcard.
    pub transmission_type: u8,
}

impl ChannelParams {
    /// Broadcast period as a wall-clock duration.
    pub fn period_duration(&self) -> Duration {
        Duration::from_micros(u64::from(self.period) * 1_000_000 / 32_768)
    }
}

/// Events raised by an ANT+ stick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AntEvent {
    /// The stick finished its reset sequence and accepts commands.
    Startup,
    Broadcast {
        channel: u8,
        device_number: u16,
        device_type: u8,
        transmission_type: u8,
        /// Present when the stick delivers extended data.
        rssi: Option<i16>,
        payload: [u8; 8],
    },
    ChannelClosed { channel: u8 },
}

/// A USB ANT+ stick.
pub trait AntStick: Send + Sync {
    /// Claim the USB device and issue a reset. Readiness is signalled by
    /// [`AntEvent::Startup`].
    fn open(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn open_channel(
        &self,
        channel: u8,
        params: ChannelParams,
        mode: ChannelMode,
    ) -> BoxFuture<'_, Result<(), Error>>;

    fn close_channel(&self, channel: u8) -> BoxFuture<'_, Result<(), Error>>;

    fn take_events(&self) -> Option<mpsc::Receiver<AntEvent>>;

    fn release(&self) -> BoxFuture<'_, ()>;
}
