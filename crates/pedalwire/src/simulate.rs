// ── Simulated sensors ──
//
// A small fleet on the loopback radios: a BLE heart rate strap and power
// meter, plus an ANT+ heart rate strap and smart trainer. One feeder task
// produces frames four times a second. BLE frames only flow once a sensor
// is connected and subscribed; ANT+ masters broadcast regardless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pedalwire_radio::ant::profile::AntProfile;
use pedalwire_radio::ble::gatt;
use pedalwire_radio::loopback::{LoopbackAntStick, LoopbackCentral, LoopbackPeripheral};

const TICK: Duration = Duration::from_millis(250);

pub const STRAP_ADDR: &str = "C0:FF:EE:00:00:01";
pub const POWER_ADDR: &str = "C0:FF:EE:00:00:02";
const ANT_STRAP_NUMBER: u16 = 4242;
const ANT_TRAINER_NUMBER: u16 = 1717;

/// Crank event time step for one revolution at about 90 rpm, in 1/1024 s.
const CRANK_STEP: u16 = 683;

pub struct Simulation {
    central: Arc<LoopbackCentral>,
    stick: Arc<LoopbackAntStick>,
    cancel: CancellationToken,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl Simulation {
    /// Register the simulated peripherals and start the feeder.
    pub async fn start() -> Self {
        let central = LoopbackCentral::shared();
        central
            .add_peripheral(
                LoopbackPeripheral::new(STRAP_ADDR, Some("Polar H10 5A1B2C"))
                    .with_service(gatt::HEART_RATE_SERVICE, gatt::HEART_RATE_MEASUREMENT)
                    .with_rssi(-58),
            )
            .await;
        central
            .add_peripheral(
                LoopbackPeripheral::new(POWER_ADDR, Some("ASSIOMA 31337"))
                    .with_service(gatt::CYCLING_POWER_SERVICE, gatt::CYCLING_POWER_MEASUREMENT)
                    .with_rssi(-71),
            )
            .await;
        let stick = Arc::new(LoopbackAntStick::new());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(feed(
            Arc::clone(&central),
            Arc::clone(&stick),
            cancel.clone(),
        ));
        info!("simulated sensors running");

        Self {
            central,
            stick,
            cancel,
            feeder: Mutex::new(Some(handle)),
        }
    }

    pub fn central(&self) -> Arc<LoopbackCentral> {
        Arc::clone(&self.central)
    }

    pub fn stick(&self) -> Arc<LoopbackAntStick> {
        Arc::clone(&self.stick)
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.feeder.lock().await.take() {
            let _ = handle.await;
        }
        debug!("simulated sensors stopped");
    }
}

// ── Feeder ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RideState {
    tick: u32,
    crank_revs: u16,
    crank_time: u16,
    hr_beats: u8,
    hr_time: u16,
}

impl RideState {
    fn advance(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        self.crank_revs = self.crank_revs.wrapping_add(1);
        self.crank_time = self.crank_time.wrapping_add(CRANK_STEP);
        self.hr_beats = self.hr_beats.wrapping_add(1);
        self.hr_time = self.hr_time.wrapping_add(256);
    }

    /// Slow 20-step swell so values move without looking random.
    fn swell(&self) -> u8 {
        let phase = u8::try_from(self.tick % 40).unwrap_or(0);
        if phase < 20 { phase } else { 40 - phase }
    }

    fn heart_rate(&self) -> u8 {
        128 + self.swell()
    }

    fn watts(&self) -> u16 {
        200 + u16::from(self.swell()) * 3
    }

    fn cadence(&self) -> u8 {
        86 + self.swell() / 4
    }
}

async fn feed(central: Arc<LoopbackCentral>, stick: Arc<LoopbackAntStick>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut state = RideState::default();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        state.advance();

        central
            .notify(STRAP_ADDR, gatt::HEART_RATE_MEASUREMENT, &heart_rate_frame(&state))
            .await;
        central
            .notify(POWER_ADDR, gatt::CYCLING_POWER_MEASUREMENT, &power_frame(&state))
            .await;

        stick
            .broadcast(
                AntProfile::HeartRate.device_type(),
                ANT_STRAP_NUMBER,
                ant_heart_rate_page(&state),
            )
            .await;
        stick
            .broadcast(
                AntProfile::FitnessEquipment.device_type(),
                ANT_TRAINER_NUMBER,
                ant_trainer_page(&state),
            )
            .await;
    }
}

// ── Frame builders ───────────────────────────────────────────────────

/// Heart Rate Measurement with an 8-bit value.
fn heart_rate_frame(state: &RideState) -> [u8; 2] {
    [0x00, state.heart_rate()]
}

/// Cycling Power Measurement carrying crank revolution data (flags bit 5).
fn power_frame(state: &RideState) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.extend_from_slice(&0x0020_u16.to_le_bytes());
    frame.extend_from_slice(&state.watts().to_le_bytes());
    frame.extend_from_slice(&state.crank_revs.to_le_bytes());
    frame.extend_from_slice(&state.crank_time.to_le_bytes());
    frame
}

fn ant_heart_rate_page(state: &RideState) -> [u8; 8] {
    let [time_lo, time_hi] = state.hr_time.to_le_bytes();
    [
        0x00,
        0xFF,
        0xFF,
        0xFF,
        time_lo,
        time_hi,
        state.hr_beats,
        state.heart_rate().saturating_sub(4),
    ]
}

/// Alternates the general FE page (speed) and the trainer page (cadence
/// and power).
fn ant_trainer_page(state: &RideState) -> [u8; 8] {
    if state.tick % 2 == 0 {
        // 9.0 m/s in 0.001 m/s units
        let [speed_lo, speed_hi] = 9000_u16.to_le_bytes();
        [0x10, 25, 0, 0, speed_lo, speed_hi, 0xFF, 0x24]
    } else {
        let [watts_lo, watts_hi] = (state.watts() + 15).to_le_bytes();
        [
            0x19,
            u8::try_from(state.tick % 256).unwrap_or(0),
            state.cadence(),
            0,
            0,
            watts_lo,
            watts_hi & 0x0F,
            0x20,
        ]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pedalwire_radio::ble::decode::decode_power;

    #[test]
    fn swell_stays_in_range() {
        let mut state = RideState::default();
        for _ in 0..200 {
            state.advance();
            assert!((128..=148).contains(&state.heart_rate()));
            assert!((200..=260).contains(&state.watts()));
        }
    }

    #[test]
    fn power_frame_decodes_with_crank_data() {
        let mut state = RideState::default();
        state.advance();
        let frame = decode_power(&power_frame(&state)).unwrap();
        assert_eq!(frame.power_w, i16::try_from(state.watts()).unwrap());
        assert!(frame.crank.is_some());
    }
}
