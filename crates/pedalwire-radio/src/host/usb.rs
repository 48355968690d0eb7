// ── ANT+ USB stick over nusb ──
//
// Dynastream ANTUSB2 and ANTUSB-m sticks expose a single interface with
// one bulk OUT and one bulk IN endpoint carrying raw ANT serial messages.
// A reader task owns the event sender, so the event stream closes when
// the stick is unplugged.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use nusb::transfer::{Queue, RequestBuffer};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ant::wire::{
    ANT_PLUS_NETWORK, ANT_PLUS_NETWORK_KEY, ChannelIdentity, EVENT_CHANNEL_CLOSED, Inbound,
    MessageReader, RESPONSE_NO_ERROR, Request,
};
use crate::error::{Error, RadioUnavailable};
use crate::hal::{AntEvent, AntStick, ChannelMode, ChannelParams};
use crate::types::Transport;

const DYNASTREAM_VENDOR_ID: u16 = 0x0FCF;
/// ANTUSB2 and ANTUSB-m.
const STICK_PRODUCT_IDS: [u16; 2] = [0x1008, 0x1009];
const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;
const READ_SIZE: usize = 64;
const READS_IN_FLIGHT: usize = 4;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const EVENT_BUFFER: usize = 256;

/// What a channel number is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Channel 0 in continuous scan mode; hears every master in range.
    Scan,
    /// Requested in scan mode but served by the scan channel.
    Covered,
    Attached(ChannelParams),
}

/// State the reader task and the command side both touch.
#[derive(Default)]
struct Shared {
    /// Waiters keyed by (channel, message id) of the expected response.
    pending: DashMap<(u8, u8), oneshot::Sender<u8>>,
    slots: DashMap<u8, Slot>,
}

impl Shared {
    /// Route one inbound message. Returns the event to forward, if any.
    fn dispatch(&self, inbound: Inbound) -> Option<AntEvent> {
        match inbound {
            Inbound::Startup => Some(AntEvent::Startup),
            Inbound::Response {
                channel,
                message,
                code,
            } => {
                match self.pending.remove(&(channel, message)) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(code);
                    }
                    None if code != RESPONSE_NO_ERROR => {
                        debug!(channel, message, code, "unsolicited ANT response");
                    }
                    None => {}
                }
                None
            }
            // Closes we asked for have already dropped their slot.
            Inbound::ChannelEvent { channel, code } if code == EVENT_CHANNEL_CLOSED => self
                .slots
                .remove(&channel)
                .map(|_| AntEvent::ChannelClosed { channel }),
            Inbound::ChannelEvent { .. } | Inbound::Other(_) => None,
            Inbound::Broadcast {
                channel,
                payload,
                identity,
                rssi,
            } => {
                let identity = identity.or_else(|| self.attached_identity(channel))?;
                Some(AntEvent::Broadcast {
                    channel,
                    device_number: identity.device_number,
                    device_type: identity.device_type,
                    transmission_type: identity.transmission_type,
                    rssi,
                    payload,
                })
            }
        }
    }

    /// Identity configured on a paired channel, for sticks that do not
    /// append extended data.
    fn attached_identity(&self, channel: u8) -> Option<ChannelIdentity> {
        match self.slots.get(&channel).map(|slot| *slot) {
            Some(Slot::Attached(params)) => Some(ChannelIdentity {
                device_number: params.device_number,
                device_type: params.device_type,
                transmission_type: params.transmission_type,
            }),
            _ => None,
        }
    }

    fn scanning(&self) -> bool {
        self.slots.iter().any(|slot| *slot.value() == Slot::Scan)
    }
}

/// The first Dynastream ANT+ stick on the USB bus.
pub struct UsbStick {
    shared: Arc<Shared>,
    link: Mutex<Option<nusb::Interface>>,
    events: StdMutex<Option<mpsc::Receiver<AntEvent>>>,
    /// Moves into the reader task when the stick is opened.
    event_tx: StdMutex<Option<mpsc::Sender<AntEvent>>>,
    network_ready: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl UsbStick {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared::default()),
            link: Mutex::new(None),
            events: StdMutex::new(Some(rx)),
            event_tx: StdMutex::new(Some(tx)),
            network_ready: AtomicBool::new(false),
            reader: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn claim(&self) -> Result<(), Error> {
        let mut link = self.link.lock().await;
        if let Some(interface) = link.as_ref() {
            // Already claimed: a second open only resets the stick.
            return write(interface, &Request::reset()).await;
        }

        let info = nusb::list_devices()
            .map_err(|e| usb_error(&e))?
            .find(|d| {
                d.vendor_id() == DYNASTREAM_VENDOR_ID && STICK_PRODUCT_IDS.contains(&d.product_id())
            })
            .ok_or(Error::unavailable(
                Transport::Ant,
                RadioUnavailable::NoRadioPresent,
            ))?;
        let product_id = info.product_id();
        let device = info.open().map_err(|e| usb_error(&e))?;
        let interface = device.claim_interface(0).map_err(|e| usb_error(&e))?;

        let tx = self
            .event_tx
            .lock()
            .ok()
            .and_then(|mut tx| tx.take())
            .ok_or_else(|| Error::Operation {
                transport: Transport::Ant,
                message: "stick event stream already consumed".to_owned(),
            })?;
        let reader = tokio::spawn(read_loop(
            interface.bulk_in_queue(ENDPOINT_IN),
            Arc::clone(&self.shared),
            tx,
            self.cancel.clone(),
        ));
        *self.reader.lock().await = Some(reader);
        info!(product_id = format_args!("{product_id:04x}"), "ANT+ stick claimed");

        write(&interface, &Request::reset()).await?;
        *link = Some(interface);
        Ok(())
    }

    async fn interface(&self) -> Result<nusb::Interface, Error> {
        self.link.lock().await.clone().ok_or(Error::unavailable(
            Transport::Ant,
            RadioUnavailable::NoRadioPresent,
        ))
    }

    /// Send a message and wait for the stick's response code.
    async fn command(&self, interface: &nusb::Interface, request: Request) -> Result<u8, Error> {
        let Some(key) = request.response_key() else {
            write(interface, &request).await?;
            return Ok(RESPONSE_NO_ERROR);
        };
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(key, tx);
        if let Err(e) = write(interface, &request).await {
            self.shared.pending.remove(&key);
            return Err(e);
        }
        if let Ok(Ok(code)) = tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(code)
        } else {
            self.shared.pending.remove(&key);
            Err(Error::Timeout {
                operation: "ANT+ command",
                timeout_secs: RESPONSE_TIMEOUT.as_secs(),
            })
        }
    }

    async fn expect_ok(&self, interface: &nusb::Interface, request: Request) -> Result<(), Error> {
        let id = request.id;
        match self.command(interface, request).await? {
            RESPONSE_NO_ERROR => Ok(()),
            code => Err(Error::Operation {
                transport: Transport::Ant,
                message: format!("stick rejected message 0x{id:02X} with code 0x{code:02X}"),
            }),
        }
    }

    /// Network key and extended data, once per claimed stick.
    async fn prepare_network(&self, interface: &nusb::Interface) -> Result<(), Error> {
        if self.network_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.expect_ok(
            interface,
            Request::network_key(ANT_PLUS_NETWORK, ANT_PLUS_NETWORK_KEY),
        )
        .await?;
        // Older sticks lack extended data; paired channels still work.
        if let Err(e) = self.expect_ok(interface, Request::enable_extended_data()).await {
            debug!(error = %e, "extended data unavailable");
        }
        self.network_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_scan(&self, interface: &nusb::Interface, params: ChannelParams) -> Result<(), Error> {
        self.expect_ok(interface, Request::assign_slave(0, ANT_PLUS_NETWORK))
            .await?;
        self.expect_ok(interface, Request::wildcard_channel_id(0)).await?;
        self.expect_ok(interface, Request::rf_frequency(0, params.rf_frequency))
            .await?;
        match self.command(interface, Request::open_rx_scan()).await? {
            RESPONSE_NO_ERROR => {
                self.shared.slots.insert(0, Slot::Scan);
                info!("ANT+ continuous scan open");
                Ok(())
            }
            code => {
                debug!(code, "stick refused continuous scan");
                if let Err(e) = self.expect_ok(interface, Request::unassign(0)).await {
                    debug!(error = %e, "unassign after refused scan");
                }
                Err(Error::unavailable(Transport::Ant, RadioUnavailable::Unsupported))
            }
        }
    }

    async fn open_attached(
        &self,
        interface: &nusb::Interface,
        channel: u8,
        params: ChannelParams,
    ) -> Result<(), Error> {
        self.expect_ok(interface, Request::assign_slave(channel, ANT_PLUS_NETWORK))
            .await?;
        self.expect_ok(interface, Request::channel_id(channel, &params))
            .await?;
        self.expect_ok(interface, Request::period(channel, params.period))
            .await?;
        self.expect_ok(interface, Request::rf_frequency(channel, params.rf_frequency))
            .await?;
        self.expect_ok(interface, Request::open(channel)).await?;
        self.shared.slots.insert(channel, Slot::Attached(params));
        debug!(channel, device_type = params.device_type, "ANT+ channel open");
        Ok(())
    }
}

impl Default for UsbStick {
    fn default() -> Self {
        Self::new()
    }
}

impl AntStick for UsbStick {
    fn open(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.claim())
    }

    fn open_channel(
        &self,
        channel: u8,
        params: ChannelParams,
        mode: ChannelMode,
    ) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let interface = self.interface().await?;
            self.prepare_network(&interface).await?;
            match mode {
                ChannelMode::Scan if channel == 0 => self.open_scan(&interface, params).await,
                // Scan mode uses the whole radio, so only channel 0 listens.
                ChannelMode::Scan if self.shared.scanning() => {
                    self.shared.slots.insert(channel, Slot::Covered);
                    Ok(())
                }
                ChannelMode::Scan => Err(Error::unavailable(
                    Transport::Ant,
                    RadioUnavailable::Unsupported,
                )),
                ChannelMode::Attach => self.open_attached(&interface, channel, params).await,
            }
        })
    }

    fn close_channel(&self, channel: u8) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            match self.shared.slots.remove(&channel).map(|(_, slot)| slot) {
                None | Some(Slot::Covered) => Ok(()),
                Some(Slot::Scan | Slot::Attached(_)) => {
                    let interface = self.interface().await?;
                    self.expect_ok(&interface, Request::close(channel)).await
                }
            }
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<AntEvent>> {
        self.events.lock().ok().and_then(|mut rx| rx.take())
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(interface) = self.link.lock().await.take() {
                if let Err(e) = write(&interface, &Request::reset()).await {
                    debug!(error = %e, "reset on release");
                }
            }
            self.cancel.cancel();
            if let Some(reader) = self.reader.lock().await.take() {
                let _ = reader.await;
            }
            self.shared.pending.clear();
            self.shared.slots.clear();
            self.network_ready.store(false, Ordering::SeqCst);
        })
    }
}

// ── USB plumbing ────────────────────────────────────────────────────

async fn write(interface: &nusb::Interface, request: &Request) -> Result<(), Error> {
    interface
        .bulk_out(ENDPOINT_OUT, request.encode())
        .await
        .into_result()
        .map(|_| ())
        .map_err(|e| Error::Operation {
            transport: Transport::Ant,
            message: format!("USB write failed: {e}"),
        })
}

async fn read_loop(
    mut queue: Queue<RequestBuffer>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<AntEvent>,
    cancel: CancellationToken,
) {
    let mut reader = MessageReader::new();
    while queue.pending() < READS_IN_FLIGHT {
        queue.submit(RequestBuffer::new(READ_SIZE));
    }

    loop {
        let completion = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            completion = queue.next_complete() => completion,
        };
        if let Err(e) = completion.status {
            warn!(error = %e, "ANT+ stick read failed, releasing stream");
            break;
        }
        reader.push(&completion.data);
        queue.submit(RequestBuffer::reuse(completion.data, READ_SIZE));

        while let Some(message) = reader.next_message() {
            if let Some(event) = shared.dispatch(Inbound::parse(&message)) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
    if reader.corrupt() > 0 {
        debug!(corrupt = reader.corrupt(), "ANT+ frames dropped on checksum");
    }
}

fn usb_error(err: &io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::PermissionDenied => {
            Error::unavailable(Transport::Ant, RadioUnavailable::PermissionDenied)
        }
        io::ErrorKind::NotFound => {
            Error::unavailable(Transport::Ant, RadioUnavailable::NoRadioPresent)
        }
        _ => Error::Operation {
            transport: Transport::Ant,
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn power_params() -> ChannelParams {
        ChannelParams {
            device_type: 11,
            period: 8182,
            rf_frequency: 57,
            device_number: 4242,
            transmission_type: 5,
        }
    }

    #[test]
    fn startup_is_forwarded() {
        let shared = Shared::default();
        assert_eq!(shared.dispatch(Inbound::Startup), Some(AntEvent::Startup));
    }

    #[test]
    fn response_resolves_its_waiter() {
        let shared = Shared::default();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.insert((2, 0x42), tx);
        let event = shared.dispatch(Inbound::Response {
            channel: 2,
            message: 0x42,
            code: 0x15,
        });
        assert_eq!(event, None);
        assert_eq!(rx.try_recv().unwrap(), 0x15);
        assert!(shared.pending.is_empty());
    }

    #[test]
    fn broadcast_without_extended_data_uses_paired_identity() {
        let shared = Shared::default();
        shared.slots.insert(1, Slot::Attached(power_params()));
        let event = shared.dispatch(Inbound::Broadcast {
            channel: 1,
            payload: [0x10; 8],
            identity: None,
            rssi: None,
        });
        assert_eq!(
            event,
            Some(AntEvent::Broadcast {
                channel: 1,
                device_number: 4242,
                device_type: 11,
                transmission_type: 5,
                rssi: None,
                payload: [0x10; 8],
            })
        );
    }

    #[test]
    fn anonymous_scan_broadcast_is_dropped() {
        let shared = Shared::default();
        shared.slots.insert(0, Slot::Scan);
        let event = shared.dispatch(Inbound::Broadcast {
            channel: 0,
            payload: [0; 8],
            identity: None,
            rssi: Some(-70),
        });
        assert_eq!(event, None);
    }

    #[test]
    fn only_unrequested_closes_are_reported() {
        let shared = Shared::default();
        shared.slots.insert(0, Slot::Scan);
        let closed = Inbound::ChannelEvent {
            channel: 0,
            code: EVENT_CHANNEL_CLOSED,
        };
        assert_eq!(
            shared.dispatch(closed.clone()),
            Some(AntEvent::ChannelClosed { channel: 0 })
        );
        // The slot is gone now, as after a requested close.
        assert_eq!(shared.dispatch(closed), None);
    }

    #[test]
    fn covered_channels_follow_the_scan_channel() {
        let shared = Shared::default();
        assert!(!shared.scanning());
        shared.slots.insert(0, Slot::Scan);
        shared.slots.insert(1, Slot::Covered);
        assert!(shared.scanning());
    }

    #[test]
    fn usb_errors_map_to_availability() {
        let denied = usb_error(&io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(
            denied.unavailable_reason(),
            Some(RadioUnavailable::PermissionDenied)
        );
        let missing = usb_error(&io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(
            missing.unavailable_reason(),
            Some(RadioUnavailable::NoRadioPresent)
        );
        let other = usb_error(&io::Error::other("pipe"));
        assert!(matches!(other, Error::Operation { .. }));
    }

    #[tokio::test]
    async fn unopened_stick_has_no_radio() {
        let stick = UsbStick::new();
        let err = stick
            .open_channel(0, power_params(), ChannelMode::Attach)
            .await
            .unwrap_err();
        assert_eq!(
            err.unavailable_reason(),
            Some(RadioUnavailable::NoRadioPresent)
        );
        assert!(stick.take_events().is_some());
        assert!(stick.take_events().is_none());
        stick.release().await;
    }
}
