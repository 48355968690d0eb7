// pedalwire-core: Device aggregation, sessions, and event fan-out over pedalwire-radio.

pub mod aggregator;
pub mod command;
pub mod config;
pub mod convert;
pub mod error;
pub mod fanout;
pub mod model;
pub mod persistence;
pub mod session;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use aggregator::Aggregator;
pub use command::{Command, CommandResult, ScanReport, StatusReport, TransportReport};
pub use config::{AggregatorConfig, SessionPolicy};
pub use error::CoreError;
pub use fanout::{ClientId, ClientMessage, Fanout, ServerMessage};
pub use persistence::{MemoryStore, ReadingStore};
pub use session::SessionTracker;
pub use store::DeviceRegistry;
pub use stream::EntityStream;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    ConnectionState, Device, DeviceId, MetricSummary, MetricType, SensorKind, SensorReading,
    Session, SessionStatus, Topic, Transport, UnifiedEvent,
};
