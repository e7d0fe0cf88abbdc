//! Session registry - live sessions keyed by id, indexed by driver
//!
//! Not internally synchronised: the tracker owns it behind a single mutex so
//! that check-and-insert in [`SessionRegistry::put`] is atomic.

use crate::error::{Result, TrackerError};
use crate::session::{Session, SessionStatus};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Registry of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    /// driver -> session id; at most one live session per driver
    by_driver: HashMap<String, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, rejecting a second live session for the same driver.
    ///
    /// On conflict the session is dropped, which cancels its accrual task.
    pub fn put(&mut self, session: Session) -> Result<()> {
        if self.by_driver.contains_key(&session.driver) {
            return Err(TrackerError::Conflict {
                driver: session.driver.clone(),
            });
        }
        self.by_driver
            .insert(session.driver.clone(), session.session_id.clone());
        self.sessions.insert(session.session_id.clone(), session);
        debug!("{} live session(s)", self.sessions.len());
        Ok(())
    }

    pub fn get_by_id(&self, session_id: &str) -> Result<&Session> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| TrackerError::session_not_found(session_id))
    }

    pub fn get_by_driver(&self, driver: &str) -> Result<&Session> {
        self.by_driver
            .get(driver)
            .and_then(|id| self.sessions.get(id))
            .ok_or_else(|| TrackerError::driver_not_found(driver))
    }

    pub fn has_driver(&self, driver: &str) -> bool {
        self.by_driver.contains_key(driver)
    }

    /// Remove a session from both indices and cancel its accrual.
    pub fn remove(&mut self, session_id: &str) -> Result<Session> {
        let mut session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| TrackerError::session_not_found(session_id))?;
        self.by_driver.remove(&session.driver);
        session.stop_accrual();
        debug!("{} live session(s)", self.sessions.len());
        Ok(session)
    }

    /// Snapshot of every live session
    pub fn list_all(&self, co2_kg_per_kwh: f64) -> Vec<SessionStatus> {
        self.sessions
            .values()
            .map(|s| s.to_status(co2_kg_per_kwh))
            .collect()
    }

    /// Ids of sessions older than `retention` at `now`
    pub fn stale_ids(&self, retention: Duration, now: Instant) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.age(now) > retention)
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Remove every session, cancelling all accrual tasks.
    pub fn drain(&mut self) -> Vec<Session> {
        self.by_driver.clear();
        self.sessions
            .drain()
            .map(|(_, mut session)| {
                session.stop_accrual();
                session
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
