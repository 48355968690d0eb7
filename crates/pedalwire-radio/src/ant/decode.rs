// ── ANT+ broadcast decoding ──
//
// Every ANT+ broadcast carries an 8-byte payload. Most profiles put a data
// page number in byte 0; speed/cadence does not.

use super::profile::AntProfile;
use crate::revolution::RevolutionTracker;
use crate::types::{DeviceId, Measurement, MetricType};

const PAGE_POWER_ONLY: u8 = 0x10;
const PAGE_FE_GENERAL: u8 = 0x10;
const PAGE_FE_TRAINER: u8 = 0x19;

const INVALID_U8: u8 = 0xFF;
const INVALID_SPEED: u16 = 0xFFFF;
const INVALID_POWER_12: u16 = 0x0FFF;

/// Broadcast-to-measurement translation for one ANT+ adapter.
#[derive(Debug, Default)]
pub struct AntDecoder {
    revolutions: RevolutionTracker,
}

impl AntDecoder {
    pub fn new(wheel_circumference_m: f64) -> Self {
        Self {
            revolutions: RevolutionTracker::new(wheel_circumference_m),
        }
    }

    pub fn decode(
        &mut self,
        device: &DeviceId,
        profile: AntProfile,
        payload: &[u8; 8],
    ) -> Vec<Measurement> {
        let reading =
            |metric, value| Measurement::new(device.clone(), metric, value, payload.as_slice());
        let mut out = Vec::new();

        match profile {
            AntProfile::HeartRate => {
                let bpm = payload[7];
                if bpm != 0 {
                    out.push(reading(MetricType::HeartRate, f64::from(bpm)));
                }
            }
            AntProfile::Power => {
                if payload[0] == PAGE_POWER_ONLY {
                    let watts = u16::from_le_bytes([payload[6], payload[7]]);
                    out.push(reading(MetricType::Power, f64::from(watts)));
                    if payload[3] != INVALID_U8 {
                        out.push(reading(MetricType::Cadence, f64::from(payload[3])));
                    }
                }
            }
            AntProfile::SpeedCadence => {
                let cadence_time = u16::from_le_bytes([payload[0], payload[1]]);
                let cadence_count = u16::from_le_bytes([payload[2], payload[3]]);
                let speed_time = u16::from_le_bytes([payload[4], payload[5]]);
                let speed_count = u16::from_le_bytes([payload[6], payload[7]]);

                if let Some(kmh) =
                    self.revolutions
                        .wheel(device, u32::from(speed_count), speed_time)
                {
                    out.push(reading(MetricType::Speed, kmh));
                }
                if let Some(rpm) = self.revolutions.crank(device, cadence_count, cadence_time) {
                    out.push(reading(MetricType::Cadence, rpm));
                }
            }
            // Each page reports only its own fields: general carries speed,
            // trainer carries power and cadence.
            AntProfile::FitnessEquipment => match payload[0] {
                PAGE_FE_GENERAL => {
                    let raw = u16::from_le_bytes([payload[4], payload[5]]);
                    if raw != INVALID_SPEED {
                        // 0.001 m/s units
                        let kmh = f64::from(raw) * 3.6 / 1000.0;
                        out.push(reading(MetricType::Speed, (kmh * 10.0).round() / 10.0));
                    }
                }
                PAGE_FE_TRAINER => {
                    let watts = u16::from(payload[5]) | (u16::from(payload[6] & 0x0F) << 8);
                    if watts != INVALID_POWER_12 {
                        out.push(reading(MetricType::Power, f64::from(watts)));
                    }
                    if payload[2] != INVALID_U8 {
                        out.push(reading(MetricType::Cadence, f64::from(payload[2])));
                    }
                }
                _ => {}
            },
        }

        out
    }

    pub fn forget(&mut self, device: &DeviceId) {
        self.revolutions.forget(device);
    }
}
