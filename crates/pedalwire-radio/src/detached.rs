// ── Detached hardware ──
//
// Stand-ins for hosts where no platform radio stack is compiled in. The
// adapters built on them report their transport as unavailable instead of
// failing to construct, so the rest of the pipeline runs unchanged.

use std::sync::Mutex;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, RadioUnavailable};
use crate::hal::{AntEvent, AntStick, BleCentral, BleEvent, ChannelMode, ChannelParams, ScanFilter};
use crate::types::Transport;

/// A BLE central that refuses every operation with
/// [`RadioUnavailable::Unsupported`].
pub struct DetachedCentral {
    rx: Mutex<Option<mpsc::Receiver<BleEvent>>>,
}

impl DetachedCentral {
    pub fn new() -> Self {
        // The sender is dropped at once; the adapter's event loop sees a
        // closed stream and exits.
        let (_tx, rx) = mpsc::channel(1);
        Self {
            rx: Mutex::new(Some(rx)),
        }
    }

    fn unsupported() -> Error {
        Error::unavailable(Transport::Ble, RadioUnavailable::Unsupported)
    }
}

impl Default for DetachedCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl BleCentral for DetachedCentral {
    fn start_scan(&self, _filter: ScanFilter) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Err(Self::unsupported()) })
    }

    fn stop_scan(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn connect<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, Result<Vec<Uuid>, Error>> {
        Box::pin(async { Err(Self::unsupported()) })
    }

    fn subscribe<'a>(
        &'a self,
        _address: &'a str,
        _characteristic: Uuid,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Err(Self::unsupported()) })
    }

    fn read_rssi<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, Result<i16, Error>> {
        Box::pin(async { Err(Self::unsupported()) })
    }

    fn disconnect<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<BleEvent>> {
        self.rx.lock().ok().and_then(|mut rx| rx.take())
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// An ANT+ stick slot with nothing plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedStick;

impl AntStick for DetachedStick {
    fn open(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async {
            Err(Error::unavailable(
                Transport::Ant,
                RadioUnavailable::NoRadioPresent,
            ))
        })
    }

    fn open_channel(
        &self,
        _channel: u8,
        _params: ChannelParams,
        _mode: ChannelMode,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async {
            Err(Error::unavailable(
                Transport::Ant,
                RadioUnavailable::NoRadioPresent,
            ))
        })
    }

    fn close_channel(&self, _channel: u8) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<AntEvent>> {
        None
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
