//! Radio layer for cycling sensors over BLE and ANT+.
//!
//! - **[`RadioAdapter`]**: The lifecycle contract shared by both
//!   transports: idempotent scan start/stop, connect/disconnect by
//!   [`DeviceId`], idempotent shutdown, and a one-shot event receiver.
//!
//! - **[`BleAdapter`]**: Filtered GATT discovery with a one-time
//!   unfiltered fallback, heuristic classification, bounded connect
//!   handshake, and measurement decoding (heart rate, cycling power,
//!   speed/cadence, FTMS indoor bike).
//!
//! - **[`AntAdapter`]**: One channel per ANT+ profile on a USB stick,
//!   connectionless "connect", and broadcast page decoding.
//!
//! - **Capabilities** ([`hal`]): [`BleCentral`](hal::BleCentral),
//!   [`AntStick`](hal::AntStick) and
//!   [`PermissionProbe`](hal::PermissionProbe) isolate the platform radio
//!   stacks. [`host`] implements them on btleplug and nusb,
//!   [`loopback`] implements them in memory, and [`detached`] stands in
//!   where no platform stack is compiled in.

pub mod adapter;
pub mod ant;
pub mod ble;
pub mod detached;
pub mod error;
mod frame;
pub mod hal;
pub mod host;
pub mod loopback;
pub mod permission;
pub mod revolution;
pub mod types;

pub use adapter::RadioAdapter;
pub use ant::{AntAdapter, AntConfig};
pub use ble::{BleAdapter, BleConfig};
pub use error::{DecodeError, Error, RadioUnavailable};
pub use permission::SysfsProbe;
pub use revolution::RevolutionTracker;
pub use types::{
    AdapterEvent, DeviceId, DiscoveredDevice, Measurement, MetricType, ParseDeviceIdError,
    RadioStatus, SensorKind, Transport, signal_strength,
};
