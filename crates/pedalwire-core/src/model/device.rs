// ── Device domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use pedalwire_radio::{DeviceId, SensorKind, Transport};

/// Lifecycle of one device, in the only order it may advance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Whether moving to `next` keeps the lifecycle moving forward.
    ///
    /// `Disconnected` ends one lifecycle; a new one may begin from it with
    /// a fresh connect attempt or a rediscovery.
    pub fn can_advance_to(self, next: Self) -> bool {
        next > self
            || (self == Self::Disconnected && matches!(next, Self::Discovered | Self::Connecting))
    }
}

/// A sensor known to the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub kind: SensorKind,
    pub transport: Transport,
    pub state: ConnectionState,
    /// 0–100.
    pub signal_strength: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// 0–100, advisory only.
    pub relevance_score: u8,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn with_state(&self, state: ConnectionState) -> Self {
        Self {
            state,
            last_seen: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_only_moves_forward() {
        use ConnectionState::{Connected, Connecting, Disconnected, Disconnecting, Discovered};

        assert!(Discovered.can_advance_to(Connecting));
        assert!(Connecting.can_advance_to(Connected));
        assert!(Connecting.can_advance_to(Disconnected));
        assert!(Connected.can_advance_to(Disconnecting));
        assert!(!Connected.can_advance_to(Connecting));
        assert!(!Disconnecting.can_advance_to(Connected));
        assert!(!Connected.can_advance_to(Connected));
    }

    #[test]
    fn disconnected_starts_a_new_lifecycle() {
        assert!(ConnectionState::Disconnected.can_advance_to(ConnectionState::Connecting));
        assert!(ConnectionState::Disconnected.can_advance_to(ConnectionState::Discovered));
        assert!(!ConnectionState::Disconnected.can_advance_to(ConnectionState::Connected));
    }
}
