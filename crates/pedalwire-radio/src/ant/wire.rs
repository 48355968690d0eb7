// ── ANT serial message framing ──
//
// Every message to or from an ANT stick is `SYNC, length, id, data..,
// checksum`, where the checksum XORs every preceding byte. USB sticks
// deliver these back to back in bulk transfers, sometimes split across
// transfer boundaries.

use crate::hal::ChannelParams;

pub const SYNC: u8 = 0xA4;

/// ANT+ managed network key.
pub const ANT_PLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

/// Network slot the ANT+ key is loaded into.
pub const ANT_PLUS_NETWORK: u8 = 0;

// ── Message ids ──
pub const MSG_CHANNEL_EVENT: u8 = 0x40;
pub const MSG_UNASSIGN_CHANNEL: u8 = 0x41;
pub const MSG_ASSIGN_CHANNEL: u8 = 0x42;
pub const MSG_CHANNEL_PERIOD: u8 = 0x43;
pub const MSG_RF_FREQUENCY: u8 = 0x45;
pub const MSG_NETWORK_KEY: u8 = 0x46;
pub const MSG_RESET_SYSTEM: u8 = 0x4A;
pub const MSG_OPEN_CHANNEL: u8 = 0x4B;
pub const MSG_CLOSE_CHANNEL: u8 = 0x4C;
pub const MSG_BROADCAST_DATA: u8 = 0x4E;
pub const MSG_ACKNOWLEDGED_DATA: u8 = 0x4F;
pub const MSG_CHANNEL_ID: u8 = 0x51;
pub const MSG_OPEN_RX_SCAN: u8 = 0x5B;
pub const MSG_LIB_CONFIG: u8 = 0x6E;
pub const MSG_STARTUP: u8 = 0x6F;

/// Channel event code carried by `MSG_CHANNEL_EVENT` with message id 1.
pub const EVENT_CHANNEL_CLOSED: u8 = 0x07;
pub const RESPONSE_NO_ERROR: u8 = 0x00;

/// Bidirectional slave: listens to a master.
const CHANNEL_TYPE_SLAVE: u8 = 0x00;

// Flagged extended data appended to broadcasts.
const EXT_CHANNEL_ID: u8 = 0x80;
const EXT_RSSI: u8 = 0x40;

/// One outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u8,
    pub data: Vec<u8>,
}

impl Request {
    fn new(id: u8, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn reset() -> Self {
        Self::new(MSG_RESET_SYSTEM, vec![0])
    }

    pub fn network_key(network: u8, key: [u8; 8]) -> Self {
        let mut data = vec![network];
        data.extend_from_slice(&key);
        Self::new(MSG_NETWORK_KEY, data)
    }

    /// Ask for channel id and RSSI on every received broadcast.
    pub fn enable_extended_data() -> Self {
        Self::new(MSG_LIB_CONFIG, vec![0, EXT_CHANNEL_ID | EXT_RSSI])
    }

    pub fn assign_slave(channel: u8, network: u8) -> Self {
        Self::new(MSG_ASSIGN_CHANNEL, vec![channel, CHANNEL_TYPE_SLAVE, network])
    }

    pub fn channel_id(channel: u8, params: &ChannelParams) -> Self {
        let [lo, hi] = params.device_number.to_le_bytes();
        Self::new(
            MSG_CHANNEL_ID,
            vec![channel, lo, hi, params.device_type, params.transmission_type],
        )
    }

    /// Wildcard channel id: any device number, type and transmission type.
    pub fn wildcard_channel_id(channel: u8) -> Self {
        Self::new(MSG_CHANNEL_ID, vec![channel, 0, 0, 0, 0])
    }

    pub fn period(channel: u8, period: u16) -> Self {
        let [lo, hi] = period.to_le_bytes();
        Self::new(MSG_CHANNEL_PERIOD, vec![channel, lo, hi])
    }

    pub fn rf_frequency(channel: u8, offset: u8) -> Self {
        Self::new(MSG_RF_FREQUENCY, vec![channel, offset])
    }

    pub fn open(channel: u8) -> Self {
        Self::new(MSG_OPEN_CHANNEL, vec![channel])
    }

    /// Continuous scan mode. Always runs on channel 0.
    pub fn open_rx_scan() -> Self {
        Self::new(MSG_OPEN_RX_SCAN, vec![0])
    }

    pub fn close(channel: u8) -> Self {
        Self::new(MSG_CLOSE_CHANNEL, vec![channel])
    }

    pub fn unassign(channel: u8) -> Self {
        Self::new(MSG_UNASSIGN_CHANNEL, vec![channel])
    }

    /// `(channel, message id)` the stick answers with, if it answers at all.
    pub fn response_key(&self) -> Option<(u8, u8)> {
        match self.id {
            MSG_RESET_SYSTEM => None,
            _ => Some((self.data.first().copied().unwrap_or(0), self.id)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 4);
        out.push(SYNC);
        // Payloads are at most 9 bytes.
        out.push(u8::try_from(self.data.len()).unwrap_or(u8::MAX));
        out.push(self.id);
        out.extend_from_slice(&self.data);
        out.push(checksum(&out));
        out
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// One inbound message, checksum already verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u8,
    pub data: Vec<u8>,
}

/// Reassembles messages from a stream of USB transfers.
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: Vec<u8>,
    corrupt: u64,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Messages dropped for a bad checksum so far.
    pub fn corrupt(&self) -> u64 {
        self.corrupt
    }

    /// Pop the next complete message. Garbage before a sync byte and
    /// messages with a bad checksum are discarded.
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            let start = self.buf.iter().position(|&b| b == SYNC)?;
            self.buf.drain(..start);

            let len = usize::from(*self.buf.get(1)?);
            let total = len + 4;
            if self.buf.len() < total {
                return None;
            }
            let frame: Vec<u8> = self.buf.drain(..total).collect();
            if checksum(&frame[..total - 1]) != frame[total - 1] {
                self.corrupt += 1;
                // Resync one byte past the bad sync.
                self.buf.splice(0..0, frame[1..].iter().copied());
                continue;
            }
            return Some(Message {
                id: frame[2],
                data: frame[3..total - 1].to_vec(),
            });
        }
    }
}

/// Identity of a transmitting master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelIdentity {
    pub device_number: u16,
    pub device_type: u8,
    pub transmission_type: u8,
}

/// What an inbound message means to a stick driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Startup,
    /// Answer to a configuration command.
    Response { channel: u8, message: u8, code: u8 },
    /// Asynchronous channel event (RX fail, channel closed, ...).
    ChannelEvent { channel: u8, code: u8 },
    Broadcast {
        channel: u8,
        payload: [u8; 8],
        identity: Option<ChannelIdentity>,
        rssi: Option<i16>,
    },
    Other(u8),
}

impl Inbound {
    pub fn parse(msg: &Message) -> Self {
        let d = msg.data.as_slice();
        match msg.id {
            MSG_STARTUP => Self::Startup,
            MSG_CHANNEL_EVENT if d.len() >= 3 => {
                if d[1] == 0x01 {
                    Self::ChannelEvent {
                        channel: d[0],
                        code: d[2],
                    }
                } else {
                    Self::Response {
                        channel: d[0],
                        message: d[1],
                        code: d[2],
                    }
                }
            }
            MSG_BROADCAST_DATA | MSG_ACKNOWLEDGED_DATA if d.len() >= 9 => {
                let mut payload = [0_u8; 8];
                payload.copy_from_slice(&d[1..9]);
                let (identity, rssi) = parse_extended(&d[9..]);
                Self::Broadcast {
                    channel: d[0],
                    payload,
                    identity,
                    rssi,
                }
            }
            other => Self::Other(other),
        }
    }
}

/// Flag byte, then channel id (4 bytes) and RSSI (3 bytes) when flagged.
fn parse_extended(ext: &[u8]) -> (Option<ChannelIdentity>, Option<i16>) {
    let Some((&flags, mut rest)) = ext.split_first() else {
        return (None, None);
    };
    let mut identity = None;
    if flags & EXT_CHANNEL_ID != 0 {
        if let Some(id) = rest.get(..4) {
            identity = Some(ChannelIdentity {
                device_number: u16::from_le_bytes([id[0], id[1]]),
                device_type: id[2] & 0x7F,
                transmission_type: id[3],
            });
            rest = &rest[4..];
        }
    }
    // Measurement type, then the signed dBm value.
    let rssi = if flags & EXT_RSSI == 0 {
        None
    } else {
        rest.get(1).map(|&raw| i16::from(i8::from_le_bytes([raw])))
    };
    (identity, rssi)
}
