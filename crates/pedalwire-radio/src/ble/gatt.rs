// ── GATT assigned numbers ──

use uuid::Uuid;

const BLUETOOTH_BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG assigned number onto the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    #[allow(clippy::as_conversions)]
    let short = short as u128;
    Uuid::from_u128(BLUETOOTH_BASE | (short << 96))
}

// ── Services ──
pub const HEART_RATE_SERVICE: Uuid = uuid16(0x180D);
pub const BATTERY_SERVICE: Uuid = uuid16(0x180F);
pub const CYCLING_SPEED_CADENCE_SERVICE: Uuid = uuid16(0x1816);
pub const CYCLING_POWER_SERVICE: Uuid = uuid16(0x1818);
pub const FITNESS_MACHINE_SERVICE: Uuid = uuid16(0x1826);

/// Services a filtered scan asks for.
pub const CYCLING_SERVICES: [Uuid; 4] = [
    CYCLING_POWER_SERVICE,
    FITNESS_MACHINE_SERVICE,
    CYCLING_SPEED_CADENCE_SERVICE,
    HEART_RATE_SERVICE,
];

// ── Measurement characteristics ──
pub const HEART_RATE_MEASUREMENT: Uuid = uuid16(0x2A37);
pub const CSC_MEASUREMENT: Uuid = uuid16(0x2A5B);
pub const CYCLING_POWER_MEASUREMENT: Uuid = uuid16(0x2A63);
pub const INDOOR_BIKE_DATA: Uuid = uuid16(0x2AD2);

/// Characteristics the adapter subscribes to after connecting.
pub const MEASUREMENT_CHARACTERISTICS: [Uuid; 4] = [
    HEART_RATE_MEASUREMENT,
    CYCLING_POWER_MEASUREMENT,
    CSC_MEASUREMENT,
    INDOOR_BIKE_DATA,
];

/// Company identifiers from advertisement manufacturer data.
pub fn company_name(id: u16) -> Option<&'static str> {
    match id {
        0x0006 => Some("Microsoft"),
        0x004C => Some("Apple"),
        0x0059 => Some("Nordic Semiconductor"),
        0x006B => Some("Polar"),
        0x0075 => Some("Samsung"),
        0x0087 => Some("Garmin"),
        0x009F => Some("Suunto"),
        _ => None,
    }
}
