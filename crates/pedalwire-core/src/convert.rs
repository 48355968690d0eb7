// ── Radio → domain conversions ──

use chrono::Utc;
use uuid::Uuid;

use pedalwire_radio::{DiscoveredDevice, Measurement};

use crate::model::{ConnectionState, Device, SensorReading};

impl From<DiscoveredDevice> for Device {
    fn from(d: DiscoveredDevice) -> Self {
        Self {
            id: d.id,
            name: d.name,
            kind: d.kind,
            transport: d.transport,
            state: ConnectionState::Discovered,
            signal_strength: d.signal_strength,
            manufacturer: d.manufacturer,
            relevance_score: d.relevance_score,
            last_seen: Utc::now(),
        }
    }
}

impl SensorReading {
    /// Attribute a decoded measurement to a session.
    pub fn attributed(m: Measurement, session_id: Uuid) -> Self {
        Self {
            unit: m.metric.unit().to_owned(),
            device_id: m.device_id,
            metric: m.metric,
            value: m.value,
            timestamp: m.timestamp,
            raw_frame: m.raw_frame,
            session_id,
        }
    }
}
