// ── Cumulative revolution counters ──
//
// Speed and cadence sensors report a running revolution count plus the
// time of the last event in 1/1024 s ticks. Rates come from the delta
// between two consecutive samples of the same device and counter.

use std::collections::HashMap;

use crate::types::DeviceId;

/// Event-time resolution used by CSC and ANT+ speed/cadence.
pub const TICKS_PER_SECOND: f64 = 1024.0;

/// Default wheel circumference for a 700x25c road tyre.
pub const DEFAULT_WHEEL_CIRCUMFERENCE_M: f64 = 2.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevolutionKind {
    Wheel,
    Crank,
}

#[derive(Debug, Clone, Copy)]
struct CounterState {
    count: u32,
    event_ticks: u16,
}

/// Per-device, per-counter previous samples.
///
/// Owned by a single adapter's event loop. Counter wraparound is not
/// unwrapped: a sample whose count or event time did not move forward
/// yields nothing but still becomes the new baseline.
#[derive(Debug)]
pub struct RevolutionTracker {
    wheel_circumference_m: f64,
    states: HashMap<(DeviceId, RevolutionKind), CounterState>,
}

impl Default for RevolutionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WHEEL_CIRCUMFERENCE_M)
    }
}

impl RevolutionTracker {
    pub fn new(wheel_circumference_m: f64) -> Self {
        Self {
            wheel_circumference_m,
            states: HashMap::new(),
        }
    }

    /// Feed a wheel sample. Returns speed in km/h rounded to 0.1.
    pub fn wheel(&mut self, device: &DeviceId, count: u32, event_ticks: u16) -> Option<f64> {
        let (revs, seconds) = self.observe(device, RevolutionKind::Wheel, count, event_ticks)?;
        let metres_per_second = revs * self.wheel_circumference_m / seconds;
        Some((metres_per_second * 3.6 * 10.0).round() / 10.0)
    }

    /// Feed a crank sample. Returns cadence in rpm rounded to a whole number.
    pub fn crank(&mut self, device: &DeviceId, count: u16, event_ticks: u16) -> Option<f64> {
        let (revs, seconds) =
            self.observe(device, RevolutionKind::Crank, u32::from(count), event_ticks)?;
        Some((revs / (seconds / 60.0)).round())
    }

    /// Drop every counter held for `device`.
    pub fn forget(&mut self, device: &DeviceId) {
        self.states.retain(|(id, _), _| id != device);
    }

    fn observe(
        &mut self,
        device: &DeviceId,
        kind: RevolutionKind,
        count: u32,
        event_ticks: u16,
    ) -> Option<(f64, f64)> {
        let next = CounterState { count, event_ticks };
        let previous = self.states.insert((device.clone(), kind), next)?;

        let delta_count = i64::from(count) - i64::from(previous.count);
        let delta_ticks = i32::from(event_ticks) - i32::from(previous.event_ticks);
        if delta_count <= 0 || delta_ticks <= 0 {
            return None;
        }

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let revs = delta_count as f64;
        Some((revs, f64::from(delta_ticks) / TICKS_PER_SECOND))
    }
}
