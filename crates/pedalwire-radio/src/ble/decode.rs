// ── GATT measurement decoding ──
//
// Pure layout parsers for each measurement characteristic, plus the
// stateful `FrameDecoder` that turns notifications into measurements.

use uuid::Uuid;

use super::gatt;
use crate::error::DecodeError;
use crate::frame::{FrameReader, bit};
use crate::revolution::RevolutionTracker;
use crate::types::{DeviceId, Measurement, MetricType};

// ── Layouts ─────────────────────────────────────────────────────────

/// Heart Rate Measurement (0x2A37). Bit 0 selects a 16-bit value.
pub fn decode_heart_rate(raw: &[u8]) -> Result<u16, DecodeError> {
    let mut r = FrameReader::new("heart rate", raw);
    let flags = r.u8()?;
    if flags & 0x01 == 0 {
        r.u8().map(u16::from)
    } else {
        r.u16()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerFrame {
    pub power_w: i16,
    /// Cumulative crank revolutions and last crank event time.
    pub crank: Option<(u16, u16)>,
}

/// Cycling Power Measurement (0x2A63).
pub fn decode_power(raw: &[u8]) -> Result<PowerFrame, DecodeError> {
    let mut r = FrameReader::new("power", raw);
    let flags = r.u16()?;
    let power_w = r.i16()?;

    let crank = if bit(flags, 5) {
        if bit(flags, 0) {
            r.skip(1)?; // pedal power balance
        }
        if bit(flags, 2) {
            r.skip(2)?; // accumulated torque
        }
        if bit(flags, 4) {
            r.skip(6)?; // wheel revolution data
        }
        Some((r.u16()?, r.u16()?))
    } else {
        None
    };

    Ok(PowerFrame { power_w, crank })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CscFrame {
    pub wheel: Option<(u32, u16)>,
    pub crank: Option<(u16, u16)>,
}

/// CSC Measurement (0x2A5B).
pub fn decode_csc(raw: &[u8]) -> Result<CscFrame, DecodeError> {
    let mut r = FrameReader::new("speed/cadence", raw);
    let flags = u16::from(r.u8()?);
    let wheel = if bit(flags, 0) {
        Some((r.u32()?, r.u16()?))
    } else {
        None
    };
    let crank = if bit(flags, 1) {
        Some((r.u16()?, r.u16()?))
    } else {
        None
    };
    Ok(CscFrame { wheel, crank })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndoorBikeFrame {
    pub speed_kmh: Option<f64>,
    pub cadence_rpm: Option<f64>,
    pub power_w: Option<i16>,
}

/// FTMS Indoor Bike Data (0x2AD2).
///
/// Instantaneous speed is present when the "more data" bit 0 is clear.
/// Fields this crate does not report are skipped by width.
pub fn decode_indoor_bike(raw: &[u8]) -> Result<IndoorBikeFrame, DecodeError> {
    let mut r = FrameReader::new("indoor bike", raw);
    let flags = r.u16()?;

    let speed_kmh = if bit(flags, 0) {
        None
    } else {
        Some(f64::from(r.u16()?) / 100.0)
    };
    if bit(flags, 1) {
        r.skip(2)?; // average speed
    }
    let cadence_rpm = if bit(flags, 2) {
        Some(f64::from(r.u16()?) / 2.0)
    } else {
        None
    };
    if bit(flags, 3) {
        r.skip(2)?; // average cadence
    }
    if bit(flags, 4) {
        r.skip(3)?; // total distance
    }
    if bit(flags, 5) {
        r.skip(2)?; // resistance level
    }
    let power_w = if bit(flags, 6) { Some(r.i16()?) } else { None };

    Ok(IndoorBikeFrame {
        speed_kmh,
        cadence_rpm,
        power_w,
    })
}

// ── FrameDecoder ────────────────────────────────────────────────────

/// Notification-to-measurement translation for one BLE adapter.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    revolutions: RevolutionTracker,
}

impl FrameDecoder {
    pub fn new(wheel_circumference_m: f64) -> Self {
        Self {
            revolutions: RevolutionTracker::new(wheel_circumference_m),
        }
    }

    /// Decode one notification. An empty result is valid (first
    /// revolution sample, or a frame with no reported fields).
    pub fn decode(
        &mut self,
        device: &DeviceId,
        characteristic: Uuid,
        raw: &[u8],
    ) -> Result<Vec<Measurement>, DecodeError> {
        let reading = |metric, value| Measurement::new(device.clone(), metric, value, raw);
        let mut out = Vec::new();

        match characteristic {
            gatt::HEART_RATE_MEASUREMENT => {
                let bpm = decode_heart_rate(raw)?;
                out.push(reading(MetricType::HeartRate, f64::from(bpm)));
            }
            gatt::CYCLING_POWER_MEASUREMENT => {
                let frame = decode_power(raw)?;
                out.push(reading(MetricType::Power, f64::from(frame.power_w)));
                if let Some((count, ticks)) = frame.crank {
                    if let Some(rpm) = self.revolutions.crank(device, count, ticks) {
                        out.push(reading(MetricType::Cadence, rpm));
                    }
                }
            }
            gatt::CSC_MEASUREMENT => {
                let frame = decode_csc(raw)?;
                if let Some((count, ticks)) = frame.wheel {
                    if let Some(kmh) = self.revolutions.wheel(device, count, ticks) {
                        out.push(reading(MetricType::Speed, kmh));
                    }
                }
                if let Some((count, ticks)) = frame.crank {
                    if let Some(rpm) = self.revolutions.crank(device, count, ticks) {
                        out.push(reading(MetricType::Cadence, rpm));
                    }
                }
            }
            gatt::INDOOR_BIKE_DATA => {
                let frame = decode_indoor_bike(raw)?;
                if let Some(w) = frame.power_w {
                    out.push(reading(MetricType::Power, f64::from(w)));
                }
                if let Some(kmh) = frame.speed_kmh {
                    out.push(reading(MetricType::Speed, kmh));
                }
                if let Some(rpm) = frame.cadence_rpm {
                    out.push(reading(MetricType::Cadence, rpm));
                }
            }
            other => return Err(DecodeError::UnknownCharacteristic(other)),
        }

        Ok(out)
    }

    /// Forget revolution state for a device that went away.
    pub fn forget(&mut self, device: &DeviceId) {
        self.revolutions.forget(device);
    }
}
