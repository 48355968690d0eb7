// ── Shared radio vocabulary ──
//
// Transport-neutral types produced by both adapters. `pedalwire-core`
// builds its domain model on top of these.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::error::RadioUnavailable;

// ── Transport ───────────────────────────────────────────────────────

/// Radio family a device was discovered on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    Ble,
    Ant,
}

impl Transport {
    /// Label used in logs and user-facing output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Ble => "BLE",
            Self::Ant => "ANT+",
        }
    }
}

// ── Sensor classification ───────────────────────────────────────────

/// What kind of sensor a device is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SensorKind {
    HeartRate,
    Power,
    Cadence,
    Speed,
    Trainer,
    #[default]
    Unknown,
}

/// Measured quantity carried by a reading.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricType {
    HeartRate,
    Power,
    Cadence,
    Speed,
}

impl MetricType {
    pub fn unit(self) -> &'static str {
        match self {
            Self::HeartRate => "bpm",
            Self::Power => "W",
            Self::Cadence => "rpm",
            Self::Speed => "km/h",
        }
    }
}

// ── DeviceId ────────────────────────────────────────────────────────

/// Transport-qualified device identifier: `ble:<address>` or
/// `ant:<profile>-<device number>`.
///
/// Stable across rediscovery of the same physical sensor on the same
/// transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(transport: Transport, local: impl AsRef<str>) -> Self {
        Self(format!("{transport}:{}", local.as_ref().to_lowercase()))
    }

    pub fn transport(&self) -> Transport {
        if self.0.starts_with("ant:") {
            Transport::Ant
        } else {
            Transport::Ble
        }
    }

    /// The transport-local part (BLE address or ANT+ channel key).
    pub fn local(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, rest)| rest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returned when a string lacks a known transport prefix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device id {0:?}: expected `ble:<address>` or `ant:<profile>-<number>`")]
pub struct ParseDeviceIdError(pub String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| ParseDeviceIdError(s.to_owned()))?;
        let transport =
            Transport::from_str(prefix).map_err(|_| ParseDeviceIdError(s.to_owned()))?;
        if rest.is_empty() {
            return Err(ParseDeviceIdError(s.to_owned()));
        }
        Ok(Self::new(transport, rest))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ParseDeviceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

// ── Adapter output ──────────────────────────────────────────────────

/// A sensor seen by an adapter, with everything needed to show it in a
/// picker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: String,
    pub kind: SensorKind,
    pub transport: Transport,
    /// 0–100.
    pub signal_strength: u8,
    pub manufacturer: Option<String>,
    /// 0–100 likelihood that this is a cycling sensor.
    pub relevance_score: u8,
}

/// One decoded value from a sensor, before session attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub device_id: DeviceId,
    pub metric: MetricType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub raw_frame: Option<Vec<u8>>,
}

impl Measurement {
    pub fn new(device_id: DeviceId, metric: MetricType, value: f64, raw: &[u8]) -> Self {
        Self {
            device_id,
            metric,
            value,
            timestamp: Utc::now(),
            raw_frame: Some(raw.to_vec()),
        }
    }
}

/// Everything an adapter reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Discovered(DiscoveredDevice),
    /// Handshake finished; the device is now streaming.
    Connected(DiscoveredDevice),
    Disconnected(DeviceId),
    Reading(Measurement),
    /// The radio stopped being usable after scanning began.
    Unavailable {
        transport: Transport,
        reason: RadioUnavailable,
    },
}

/// Result of a permission/availability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    Ready,
    Unavailable(RadioUnavailable),
}

// ── Signal strength ─────────────────────────────────────────────────

/// Map RSSI (dBm) onto 0–100: -90 dBm or weaker is 0, -30 dBm or
/// stronger is 100.
pub fn signal_strength(rssi: i16) -> u8 {
    let scaled = (i32::from(rssi) + 90) * 100 / 60;
    u8::try_from(scaled.clamp(0, 100)).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_transport_qualified() {
        let id = DeviceId::new(Transport::Ble, "AA:BB:CC:DD:EE:FF");
        assert_eq!(id.as_str(), "ble:aa:bb:cc:dd:ee:ff");
        assert_eq!(id.transport(), Transport::Ble);
        assert_eq!(id.local(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn device_id_parses_ant() {
        let id: DeviceId = "ant:hr-12345".parse().unwrap();
        assert_eq!(id.transport(), Transport::Ant);
        assert_eq!(id.local(), "hr-12345");
    }

    #[test]
    fn device_id_rejects_unknown_prefix() {
        assert!("wifi:abc".parse::<DeviceId>().is_err());
        assert!("ble:".parse::<DeviceId>().is_err());
        assert!("nocolon".parse::<DeviceId>().is_err());
    }

    #[test]
    fn device_id_serializes_as_string() {
        let id = DeviceId::new(Transport::Ant, "pwr-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ant:pwr-7\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn signal_strength_clamps() {
        assert_eq!(signal_strength(-90), 0);
        assert_eq!(signal_strength(-100), 0);
        assert_eq!(signal_strength(-60), 50);
        assert_eq!(signal_strength(-30), 100);
        assert_eq!(signal_strength(-10), 100);
    }

    #[test]
    fn metric_units() {
        assert_eq!(MetricType::HeartRate.unit(), "bpm");
        assert_eq!(MetricType::Speed.unit(), "km/h");
        assert_eq!(MetricType::Power.to_string(), "power");
        assert_eq!(SensorKind::HeartRate.to_string(), "heart_rate");
    }
}
