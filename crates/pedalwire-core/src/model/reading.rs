use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pedalwire_radio::{DeviceId, MetricType};

/// One normalized value, attributed to exactly one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: DeviceId,
    pub metric: MetricType,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_frame: Option<Vec<u8>>,
    pub session_id: Uuid,
}
