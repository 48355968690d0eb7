// ── Device registry ──
//
// The aggregator's discovered/connected maps plus the scanning flag.
// Mutations are per-entry atomic; promotion and demotion are idempotent so
// the control path and the adapter event path may race safely.

mod collection;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use pedalwire_radio::DeviceId;

use crate::model::{ConnectionState, Device};
use crate::stream::EntityStream;

pub(crate) use collection::EntityCollection;

/// Discovered and connected devices, keyed by transport-qualified id.
pub struct DeviceRegistry {
    discovered: EntityCollection<Device>,
    connected: EntityCollection<Device>,
    scanning: watch::Sender<bool>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (scanning, _) = watch::channel(false);
        Self {
            discovered: EntityCollection::new(),
            connected: EntityCollection::new(),
            scanning,
        }
    }

    // ── Scanning flag ────────────────────────────────────────────────

    /// Flip the flag on. Returns `false` if it was already on.
    pub fn begin_scan(&self) -> bool {
        self.scanning.send_if_modified(|s| {
            if *s {
                false
            } else {
                *s = true;
                true
            }
        })
    }

    /// Flip the flag off. Returns `false` if it was already off.
    pub fn end_scan(&self) -> bool {
        self.scanning.send_if_modified(|s| std::mem::replace(s, false))
    }

    pub fn is_scanning(&self) -> bool {
        *self.scanning.borrow()
    }

    // ── Discovery ────────────────────────────────────────────────────

    /// Drop discovered entries left over from a previous scan. Entries with
    /// a connect in flight stay.
    pub fn clear_stale_discoveries(&self) {
        self.discovered.retain(|d| {
            !matches!(
                d.state,
                ConnectionState::Discovered | ConnectionState::Disconnected
            )
        });
    }

    /// Record a discovery. Returns the device if it was not known yet.
    pub fn record_discovery(&self, device: Device) -> Option<Device> {
        if self.connected.contains(&device.id) {
            return None;
        }
        let id = device.id.clone();
        if self.discovered.insert_if_absent(id, device.clone()) {
            return Some(device);
        }
        // Rediscovery of a device whose last lifecycle ended starts a new one.
        self.discovered
            .update(&device.id, |current| {
                (current.state == ConnectionState::Disconnected).then(|| device.clone())
            })
            .map(|d| (*d).clone())
    }

    /// Move a discovered device to `state`, if that keeps its lifecycle
    /// moving forward.
    pub fn set_discovered_state(&self, id: &DeviceId, state: ConnectionState) -> Option<Device> {
        self.discovered
            .update(id, |current| {
                if current.state.can_advance_to(state) {
                    Some(current.with_state(state))
                } else {
                    warn!(device_id = %id, from = %current.state, to = %state, "rejected state change");
                    None
                }
            })
            .map(|d| (*d).clone())
    }

    // ── Connection ───────────────────────────────────────────────────

    /// Move a device into the connected map. Returns the connected device
    /// only for the caller that performed the move.
    pub fn promote(&self, device: &Device) -> Option<Device> {
        let connected = device.with_state(ConnectionState::Connected);
        if !self
            .connected
            .insert_if_absent(connected.id.clone(), connected.clone())
        {
            return None;
        }
        self.discovered.remove(&connected.id);
        Some(connected)
    }

    /// Mark a connected device as disconnecting.
    pub fn mark_disconnecting(&self, id: &DeviceId) -> Option<Device> {
        self.connected
            .update(id, |current| {
                current
                    .state
                    .can_advance_to(ConnectionState::Disconnecting)
                    .then(|| current.with_state(ConnectionState::Disconnecting))
            })
            .map(|d| (*d).clone())
    }

    /// Remove a connected device. Returns it, in the `Disconnected` state,
    /// only for the caller that performed the removal.
    ///
    /// The device goes back to the discovered set so it can be connected
    /// again without waiting for the next scan.
    pub fn demote(&self, id: &DeviceId) -> Option<Device> {
        let gone = self
            .connected
            .remove(id)?
            .with_state(ConnectionState::Disconnected);
        self.discovered.upsert(id.clone(), gone.clone());
        Some(gone)
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Connected first, then discovered.
    pub fn lookup(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.connected.get(id).or_else(|| self.discovered.get(id))
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.connected.contains(id)
    }

    pub fn connected_ids(&self) -> Vec<DeviceId> {
        self.connected.keys()
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn has_connected(&self) -> bool {
        !self.connected.is_empty()
    }

    pub fn discovered_snapshot(&self) -> Arc<Vec<Arc<Device>>> {
        self.discovered.snapshot()
    }

    pub fn connected_snapshot(&self) -> Arc<Vec<Arc<Device>>> {
        self.connected.snapshot()
    }

    pub fn discovered_stream(&self) -> EntityStream<Device> {
        EntityStream::new(self.discovered.subscribe())
    }

    pub fn connected_stream(&self) -> EntityStream<Device> {
        EntityStream::new(self.connected.subscribe())
    }

    /// Forget every device. Used on shutdown.
    pub fn clear(&self) {
        self.discovered.clear();
        self.connected.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pedalwire_radio::{SensorKind, Transport};

    fn device(local: &str) -> Device {
        Device {
            id: DeviceId::new(Transport::Ble, local),
            name: local.into(),
            kind: SensorKind::HeartRate,
            transport: Transport::Ble,
            state: ConnectionState::Discovered,
            signal_strength: 50,
            manufacturer: None,
            relevance_score: 90,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn scanning_flag_is_check_and_set() {
        let reg = DeviceRegistry::new();
        assert!(reg.begin_scan());
        assert!(!reg.begin_scan());
        assert!(reg.is_scanning());
        assert!(reg.end_scan());
        assert!(!reg.end_scan());
    }

    #[test]
    fn discovery_reported_once() {
        let reg = DeviceRegistry::new();
        assert!(reg.record_discovery(device("a")).is_some());
        assert!(reg.record_discovery(device("a")).is_none());
        assert_eq!(reg.discovered_count(), 1);
    }

    #[test]
    fn promotion_is_idempotent() {
        let reg = DeviceRegistry::new();
        let d = device("a");
        reg.record_discovery(d.clone());

        let promoted = reg.promote(&d).unwrap();
        assert_eq!(promoted.state, ConnectionState::Connected);
        assert!(reg.promote(&d).is_none());
        assert_eq!(reg.discovered_count(), 0);
        assert_eq!(reg.connected_count(), 1);
    }

    #[test]
    fn connected_devices_are_not_rediscovered() {
        let reg = DeviceRegistry::new();
        let d = device("a");
        reg.record_discovery(d.clone());
        reg.promote(&d);
        assert!(reg.record_discovery(device("a")).is_none());
        assert_eq!(reg.discovered_count(), 0);
    }

    #[test]
    fn demotion_happens_once() {
        let reg = DeviceRegistry::new();
        let d = device("a");
        reg.promote(&d);
        assert!(reg.mark_disconnecting(&d.id).is_some());
        let gone = reg.demote(&d.id).unwrap();
        assert_eq!(gone.state, ConnectionState::Disconnected);
        assert!(reg.demote(&d.id).is_none());
        assert!(!reg.has_connected());
    }

    #[test]
    fn demoted_device_can_connect_again() {
        let reg = DeviceRegistry::new();
        let d = device("a");
        reg.record_discovery(d.clone());
        reg.promote(&d);
        reg.demote(&d.id);

        let parked = reg.lookup(&d.id).unwrap();
        assert_eq!(parked.state, ConnectionState::Disconnected);
        assert_eq!(reg.discovered_count(), 1);
        let connecting = reg
            .set_discovered_state(&d.id, ConnectionState::Connecting)
            .unwrap();
        assert!(reg.promote(&connecting).is_some());
        assert_eq!(reg.discovered_count(), 0);
    }

    #[test]
    fn state_changes_only_move_forward() {
        let reg = DeviceRegistry::new();
        let d = device("a");
        reg.record_discovery(d.clone());
        assert!(reg
            .set_discovered_state(&d.id, ConnectionState::Connecting)
            .is_some());
        assert!(reg
            .set_discovered_state(&d.id, ConnectionState::Discovered)
            .is_none());
        assert!(reg
            .set_discovered_state(&d.id, ConnectionState::Disconnected)
            .is_some());
        assert!(reg
            .set_discovered_state(&d.id, ConnectionState::Connecting)
            .is_some());
    }

    #[test]
    fn stale_discoveries_cleared_but_in_flight_kept() {
        let reg = DeviceRegistry::new();
        reg.record_discovery(device("idle"));
        let busy = device("busy");
        reg.record_discovery(busy.clone());
        reg.set_discovered_state(&busy.id, ConnectionState::Connecting);

        reg.clear_stale_discoveries();
        assert_eq!(reg.discovered_count(), 1);
        assert!(reg.lookup(&busy.id).is_some());
    }

    #[test]
    fn failed_lifecycle_can_be_rediscovered() {
        let reg = DeviceRegistry::new();
        let d = device("a");
        reg.record_discovery(d.clone());
        reg.set_discovered_state(&d.id, ConnectionState::Disconnected);
        let again = reg.record_discovery(device("a")).unwrap();
        assert_eq!(again.state, ConnectionState::Discovered);
    }
}
