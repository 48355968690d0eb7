// ── ANT+ device profiles ──

use crate::hal::ChannelParams;
use crate::types::{DeviceId, SensorKind, Transport};

/// RF channel shared by every ANT+ profile (2457 MHz).
pub const ANT_PLUS_FREQUENCY: u8 = 57;

/// The ANT+ profiles this crate listens for. Each gets one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AntProfile {
    HeartRate,
    Power,
    SpeedCadence,
    FitnessEquipment,
}

impl AntProfile {
    pub const ALL: [Self; 4] = [
        Self::HeartRate,
        Self::Power,
        Self::SpeedCadence,
        Self::FitnessEquipment,
    ];

    pub fn device_type(self) -> u8 {
        match self {
            Self::HeartRate => 120,
            Self::Power => 11,
            Self::SpeedCadence => 121,
            Self::FitnessEquipment => 17,
        }
    }

    pub fn from_device_type(device_type: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.device_type() == device_type)
    }

    /// Message period in 1/32768 s.
    pub fn period(self) -> u16 {
        match self {
            Self::HeartRate => 8070,
            Self::Power => 8182,
            Self::SpeedCadence => 8086,
            Self::FitnessEquipment => 8192,
        }
    }

    pub fn sensor_kind(self) -> SensorKind {
        match self {
            Self::HeartRate => SensorKind::HeartRate,
            Self::Power => SensorKind::Power,
            Self::SpeedCadence => SensorKind::Cadence,
            Self::FitnessEquipment => SensorKind::Trainer,
        }
    }

    fn slug(self) -> &'static str {
        match self {
            Self::HeartRate => "hr",
            Self::Power => "pwr",
            Self::SpeedCadence => "spdcad",
            Self::FitnessEquipment => "fec",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::HeartRate => "Heart Rate",
            Self::Power => "Power",
            Self::SpeedCadence => "Speed/Cadence",
            Self::FitnessEquipment => "Trainer",
        }
    }

    /// Wildcard channel parameters that pair with any master of this profile.
    pub fn channel_params(self) -> ChannelParams {
        ChannelParams {
            device_type: self.device_type(),
            period: self.period(),
            rf_frequency: ANT_PLUS_FREQUENCY,
            device_number: 0,
            transmission_type: 0,
        }
    }

    pub fn device_id(self, device_number: u16) -> DeviceId {
        DeviceId::new(Transport::Ant, format!("{}-{device_number}", self.slug()))
    }

    pub fn display_name(self, device_number: u16) -> String {
        format!("ANT+ {} {device_number}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_types_round_trip() {
        for profile in AntProfile::ALL {
            assert_eq!(
                AntProfile::from_device_type(profile.device_type()),
                Some(profile)
            );
        }
        assert_eq!(AntProfile::from_device_type(0), None);
    }

    #[test]
    fn device_id_carries_profile_and_number() {
        assert_eq!(
            AntProfile::FitnessEquipment.device_id(4242).as_str(),
            "ant:fec-4242"
        );
        assert_eq!(AntProfile::HeartRate.display_name(7), "ANT+ Heart Rate 7");
    }

    #[test]
    fn channel_params_use_ant_plus_frequency() {
        let params = AntProfile::Power.channel_params();
        assert_eq!(params.rf_frequency, 57);
        assert_eq!(params.period, 8182);
        assert_eq!(params.device_number, 0);
    }
}
