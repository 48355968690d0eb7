// ── Persistence interface ──
//
// The aggregator appends every attributed reading and every session
// transition here. Failures are logged by the caller, never retried.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{MetricType, SensorReading, Session};

/// Durable append/query store for readings and sessions.
pub trait ReadingStore: Send + Sync {
    fn append_reading(&self, reading: &SensorReading) -> Result<(), CoreError>;

    fn append_session(&self, session: &Session) -> Result<(), CoreError>;

    /// Replace a stored session. Fails if it was never appended.
    fn update_session(&self, session: &Session) -> Result<(), CoreError>;

    fn readings_for_session(&self, session_id: Uuid) -> Result<Vec<SensorReading>, CoreError>;

    /// Readings with `from <= timestamp < to`, oldest first.
    fn readings_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        metric: Option<MetricType>,
    ) -> Result<Vec<SensorReading>, CoreError>;

    /// All sessions, newest first.
    fn sessions(&self) -> Result<Vec<Session>, CoreError>;
}

// ── In-memory store ──────────────────────────────────────────────

/// Process-local [`ReadingStore`]. Used by `serve` when no external store is
/// wired in, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    readings: Mutex<Vec<SensorReading>>,
    sessions: DashMap<Uuid, Session>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reading_count(&self) -> usize {
        self.readings.lock().map(|r| r.len()).unwrap_or_default()
    }

    fn with_readings<R>(&self, f: impl FnOnce(&mut Vec<SensorReading>) -> R) -> Result<R, CoreError> {
        let mut guard = self.readings.lock().map_err(|_| CoreError::Persistence {
            message: "reading log lock poisoned".into(),
        })?;
        Ok(f(&mut guard))
    }
}

impl ReadingStore for MemoryStore {
    fn append_reading(&self, reading: &SensorReading) -> Result<(), CoreError> {
        self.with_readings(|r| r.push(reading.clone()))
    }

    fn append_session(&self, session: &Session) -> Result<(), CoreError> {
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn update_session(&self, session: &Session) -> Result<(), CoreError> {
        let mut entry = self
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| CoreError::Persistence {
                message: format!("unknown session {}", session.id),
            })?;
        *entry = session.clone();
        Ok(())
    }

    fn readings_for_session(&self, session_id: Uuid) -> Result<Vec<SensorReading>, CoreError> {
        self.with_readings(|r| {
            r.iter()
                .filter(|reading| reading.session_id == session_id)
                .cloned()
                .collect()
        })
    }

    fn readings_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        metric: Option<MetricType>,
    ) -> Result<Vec<SensorReading>, CoreError> {
        if to < from {
            return Err(CoreError::InvalidRequest {
                message: format!("range end {to} precedes start {from}"),
            });
        }
        self.with_readings(|r| {
            let mut hits: Vec<SensorReading> = r
                .iter()
                .filter(|reading| reading.timestamp >= from && reading.timestamp < to)
                .filter(|reading| metric.is_none_or(|m| reading.metric == m))
                .cloned()
                .collect();
            hits.sort_by_key(|reading| reading.timestamp);
            hits
        })
    }

    fn sessions(&self) -> Result<Vec<Session>, CoreError> {
        let mut all: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(all)
    }
}
