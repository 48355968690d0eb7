// ── Command API ──
//
// Every control operation flows through one `Command` enum. The aggregator
// routes each variant to the registry, an adapter, or the session tracker.

use serde::Serialize;

use pedalwire_radio::{RadioUnavailable, Transport};

use crate::model::{Device, DeviceId, Session};

/// All control operations against the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // ── Discovery ────────────────────────────────────────────────────
    StartScanning,
    StopScanning,

    // ── Devices ──────────────────────────────────────────────────────
    ConnectDevice { id: DeviceId },
    DisconnectDevice { id: DeviceId },

    // ── Sessions ─────────────────────────────────────────────────────
    StartSession { name: Option<String> },
    StopSession,
    PauseSession,
    ResumeSession,

    // ── Introspection ────────────────────────────────────────────────
    GetStatus,
}

/// Outcome of a successful [`Command`].
#[derive(Debug, Clone)]
pub enum CommandResult {
    Ok,
    Scan(ScanReport),
    Device(Device),
    Session(Session),
    Status(Box<StatusReport>),
}

/// Availability of one transport as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportReport {
    pub transport: Transport,
    /// `None` until the transport has been started once.
    pub available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RadioUnavailable>,
    pub decode_errors: u64,
}

/// What a `StartScanning` call achieved per transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Scanning was already running; nothing was restarted.
    pub already_scanning: bool,
    pub transports: Vec<TransportReport>,
}

impl ScanReport {
    pub fn started(&self) -> impl Iterator<Item = Transport> + '_ {
        self.transports
            .iter()
            .filter(|t| t.available == Some(true))
            .map(|t| t.transport)
    }
}

/// Everything `get-status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub scanning: bool,
    pub transports: Vec<TransportReport>,
    pub discovered: Vec<Device>,
    pub connected: Vec<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    pub dropped_readings: u64,
}
