// ── Unified event stream ──
//
// Everything the aggregator and session tracker publish. Each event
// belongs to exactly one subscription topic.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use pedalwire_radio::{DeviceId, RadioUnavailable, Transport};

use super::{ConnectionState, Device, SensorReading, Session};

/// Subscription topics.
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
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Topic {
    DeviceEvents,
    SensorData,
    SessionEvents,
}

/// An event on the unified stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UnifiedEvent {
    DeviceDiscovered {
        device: Device,
    },
    DeviceStatus {
        device_id: DeviceId,
        state: ConnectionState,
        device: Device,
    },
    /// A radio became usable or stopped being usable.
    TransportStatus {
        transport: Transport,
        available: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RadioUnavailable>,
    },
    SensorData {
        reading: SensorReading,
    },
    SessionStarted {
        session: Session,
    },
    SessionPaused {
        session: Session,
    },
    SessionResumed {
        session: Session,
    },
    SessionStopped {
        session: Session,
    },
}

impl UnifiedEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::DeviceDiscovered { .. }
            | Self::DeviceStatus { .. }
            | Self::TransportStatus { .. } => Topic::DeviceEvents,
            Self::SensorData { .. } => Topic::SensorData,
            Self::SessionStarted { .. }
            | Self::SessionPaused { .. }
            | Self::SessionResumed { .. }
            | Self::SessionStopped { .. } => Topic::SessionEvents,
        }
    }

    pub fn status(device: &Device) -> Self {
        Self::DeviceStatus {
            device_id: device.id.clone(),
            state: device.state,
            device: device.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topics_use_kebab_case() {
        assert_eq!(Topic::SensorData.to_string(), "sensor-data");
        assert_eq!("device-events".parse::<Topic>().unwrap(), Topic::DeviceEvents);
        assert_eq!(
            serde_json::to_value(Topic::SessionEvents).unwrap(),
            json!("session-events")
        );
    }

    #[test]
    fn transport_status_is_tagged() {
        let event = UnifiedEvent::TransportStatus {
            transport: Transport::Ant,
            available: false,
            reason: Some(RadioUnavailable::NoRadioPresent),
        };
        assert_eq!(event.topic(), Topic::DeviceEvents);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "transport-status",
                "transport": "ant",
                "available": false,
                "reason": "no_radio_present"
            })
        );
    }

    #[test]
    fn session_events_share_a_topic() {
        let session = Session::new("ride");
        for event in [
            UnifiedEvent::SessionStarted {
                session: session.clone(),
            },
            UnifiedEvent::SessionPaused {
                session: session.clone(),
            },
            UnifiedEvent::SessionStopped { session },
        ] {
            assert_eq!(event.topic(), Topic::SessionEvents);
        }
    }
}
