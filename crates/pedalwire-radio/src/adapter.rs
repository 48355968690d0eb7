// ── RadioAdapter contract ──
//
// Both transports expose the same lifecycle to the aggregator. Every
// adapter owns its hardware handle and one event loop; results flow up
// through the receiver handed out by `take_events`.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::types::{AdapterEvent, DeviceId, Transport};

/// Capacity of the channel from an adapter's event loop to its consumer.
pub const ADAPTER_EVENT_BUFFER: usize = 256;

/// One transport's discovery, connection lifecycle, and decoding.
pub trait RadioAdapter: Send + Sync {
    fn transport(&self) -> Transport;

    /// Begin discovery. Idempotent. An absent or blocked radio resolves to
    /// [`Error::Unavailable`] instead of failing the process.
    fn start_scanning(&self) -> BoxFuture<'_, Result<(), Error>>;

    /// Idempotent.
    fn stop_scanning(&self) -> BoxFuture<'_, ()>;

    /// Connect a device from the discovered set. `false` means the
    /// handshake failed; nothing is emitted in that case.
    fn connect_device<'a>(&'a self, id: &'a DeviceId) -> BoxFuture<'a, bool>;

    /// Tear down streaming for a connected device.
    fn disconnect_device<'a>(&'a self, id: &'a DeviceId) -> BoxFuture<'a, bool>;

    /// Release the hardware. Idempotent.
    fn shutdown(&self) -> BoxFuture<'_, ()>;

    /// Hand over the event receiver. `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<AdapterEvent>>;

    /// Frames that failed to decode since construction.
    fn decode_errors(&self) -> u64;
}
