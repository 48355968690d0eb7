// ── Runtime aggregator configuration ──
//
// Describes how the aggregator behaves once adapters are wired in. Never
// touches disk; `pedalwire-config` builds one from the TOML file.

use std::time::Duration;

/// What to do with a reading that arrives while no session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    /// Start a session implicitly and attribute the reading to it.
    #[default]
    AutoStart,
    /// Count the reading as dropped and do not forward it.
    Drop,
}

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Scanning stops on its own after this long.
    pub scan_window: Duration,
    pub session_policy: SessionPolicy,
    /// Capacity of the unified event broadcast channel.
    pub event_buffer: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(60),
            session_policy: SessionPolicy::AutoStart,
            event_buffer: 1024,
        }
    }
}
