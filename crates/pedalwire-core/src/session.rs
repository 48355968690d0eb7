// ── Session tracking ──
//
// none → active ⇄ paused → completed. At most one session is open at a
// time; every forwarded reading is attributed to it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use pedalwire_radio::Measurement;

use crate::config::SessionPolicy;
use crate::error::CoreError;
use crate::model::{MetricSummary, MetricType, SensorReading, Session, SessionStatus, UnifiedEvent};
use crate::persistence::ReadingStore;

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    sum: f64,
    max: f64,
    count: u64,
}

impl Accumulator {
    fn add(&mut self, value: f64) {
        self.max = if self.count == 0 { value } else { self.max.max(value) };
        self.sum += value;
        self.count += 1;
    }

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn summary(&self) -> MetricSummary {
        MetricSummary {
            avg: if self.count == 0 { 0.0 } else { self.sum / self.count as f64 },
            max: self.max,
            count: self.count,
        }
    }
}

struct OpenSession {
    session: Session,
    totals: BTreeMap<MetricType, Accumulator>,
}

impl OpenSession {
    fn new(session: Session) -> Self {
        Self {
            session,
            totals: BTreeMap::new(),
        }
    }

    /// The session with its running aggregates filled in.
    fn view(&self) -> Session {
        let mut session = self.session.clone();
        session.metrics = self.totals.iter().map(|(m, acc)| (*m, acc.summary())).collect();
        session
    }
}

/// Owns the single open session and attributes readings to it.
pub struct SessionTracker {
    policy: SessionPolicy,
    open: Mutex<Option<OpenSession>>,
    store: Arc<dyn ReadingStore>,
    events: broadcast::Sender<Arc<UnifiedEvent>>,
    dropped: AtomicU64,
}

impl SessionTracker {
    pub fn new(
        policy: SessionPolicy,
        store: Arc<dyn ReadingStore>,
        events: broadcast::Sender<Arc<UnifiedEvent>>,
    ) -> Self {
        Self {
            policy,
            open: Mutex::new(None),
            store,
            events,
            dropped: AtomicU64::new(0),
        }
    }

    /// Start a session. Fails while another one is active or paused.
    pub async fn start(&self, name: Option<String>) -> Result<Session, CoreError> {
        let mut open = self.open.lock().await;
        if let Some(existing) = open.as_ref() {
            return Err(CoreError::SessionAlreadyActive {
                id: existing.session.id,
            });
        }
        let session = self.begin(name);
        *open = Some(OpenSession::new(session.clone()));
        Ok(session)
    }

    pub async fn pause(&self) -> Result<Session, CoreError> {
        let mut open = self.open.lock().await;
        let current = open.as_mut().ok_or(CoreError::NoActiveSession)?;
        require(&current.session, SessionStatus::Active)?;
        current.session.status = SessionStatus::Paused;

        let session = current.view();
        self.persist_update(&session);
        info!(session_id = %session.id, "session paused");
        self.publish(UnifiedEvent::SessionPaused {
            session: session.clone(),
        });
        Ok(session)
    }

    pub async fn resume(&self) -> Result<Session, CoreError> {
        let mut open = self.open.lock().await;
        let current = open.as_mut().ok_or(CoreError::NoActiveSession)?;
        require(&current.session, SessionStatus::Paused)?;
        current.session.status = SessionStatus::Active;

        let session = current.view();
        self.persist_update(&session);
        info!(session_id = %session.id, "session resumed");
        self.publish(UnifiedEvent::SessionResumed {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Complete the open session and finalize its per-metric aggregates.
    pub async fn end(&self) -> Result<Session, CoreError> {
        let finished = self.open.lock().await.take().ok_or(CoreError::NoActiveSession)?;

        let mut session = finished.view();
        session.status = SessionStatus::Completed;
        session.end_time = Some(Utc::now());

        self.persist_update(&session);
        info!(
            session_id = %session.id,
            metrics = session.metrics.len(),
            "session completed"
        );
        self.publish(UnifiedEvent::SessionStopped {
            session: session.clone(),
        });
        Ok(session)
    }

    /// The open session, with running aggregates.
    pub async fn current(&self) -> Option<Session> {
        self.open.lock().await.as_ref().map(OpenSession::view)
    }

    /// Attach a measurement to the open session, starting one first when
    /// none exists and the policy allows it. `None` means the reading was
    /// dropped.
    pub async fn attribute(&self, measurement: Measurement) -> Option<SensorReading> {
        let mut open = self.open.lock().await;
        if open.is_none() {
            match self.policy {
                SessionPolicy::AutoStart => {
                    let session = self.begin(None);
                    debug!(session_id = %session.id, "session auto-started by reading");
                    *open = Some(OpenSession::new(session));
                }
                SessionPolicy::Drop => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(device_id = %measurement.device_id, "reading dropped, no session");
                    return None;
                }
            }
        }
        let current = open.as_mut()?;
        current
            .totals
            .entry(measurement.metric)
            .or_default()
            .add(measurement.value);
        Some(SensorReading::attributed(measurement, current.session.id))
    }

    /// Readings discarded because no session was open.
    pub fn dropped_readings(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn begin(&self, name: Option<String>) -> Session {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Ride {}", Utc::now().format("%Y-%m-%d %H:%M")));
        let session = Session::new(name);
        if let Err(e) = self.store.append_session(&session) {
            warn!(session_id = %session.id, error = %e, "failed to persist session");
        }
        info!(session_id = %session.id, name = %session.name, "session started");
        self.publish(UnifiedEvent::SessionStarted {
            session: session.clone(),
        });
        session
    }

    fn persist_update(&self, session: &Session) {
        if let Err(e) = self.store.update_session(session) {
            warn!(session_id = %session.id, error = %e, "failed to persist session");
        }
    }

    fn publish(&self, event: UnifiedEvent) {
        // No receivers is fine.
        let _ = self.events.send(Arc::new(event));
    }
}

fn require(session: &Session, expected: SessionStatus) -> Result<(), CoreError> {
    if session.status == expected {
        Ok(())
    } else {
        Err(CoreError::InvalidSessionState {
            expected: match expected {
                SessionStatus::Active => "active",
                SessionStatus::Paused => "paused",
                SessionStatus::Completed => "completed",
            },
            actual: session.status.to_string(),
        })
    }
}
