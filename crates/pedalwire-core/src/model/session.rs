// ── Session domain types ──

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use pedalwire_radio::MetricType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
}

/// Per-metric aggregate over every reading attributed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub avg: f64,
    pub max: f64,
    pub count: u64,
}

/// A recording session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Running while the session is open; final once completed.
    #[serde(default)]
    pub metrics: BTreeMap<MetricType, MetricSummary>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: SessionStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            metrics: BTreeMap::new(),
        }
    }

    /// Active or paused.
    pub fn is_open(&self) -> bool {
        self.status != SessionStatus::Completed
    }
}
