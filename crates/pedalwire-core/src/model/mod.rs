// ── Domain model ──

pub mod device;
pub mod event;
pub mod reading;
pub mod session;

pub use device::{ConnectionState, Device};
pub use event::{Topic, UnifiedEvent};
pub use reading::SensorReading;
pub use session::{MetricSummary, Session, SessionStatus};

pub use pedalwire_radio::{DeviceId, MetricType, SensorKind, Transport};
