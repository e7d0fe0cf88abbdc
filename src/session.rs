//! Live charging session and the snapshot types handed to callers

use crate::config::PointsPolicy;
use crate::ticker::{TickHandle, Ticker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fresh 128-bit random session id, hex encoded.
pub(crate) fn new_session_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Energy and points accumulated so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Accrual {
    pub energy_kwh: f64,
    pub points: f64,
}

impl Accrual {
    fn apply_tick(&mut self, energy_step: f64, policy: PointsPolicy) {
        self.energy_kwh += energy_step;
        self.points += policy.points_for(energy_step);
    }
}

/// A live charging session owned by the registry
#[derive(Debug)]
pub struct Session {
    pub(crate) session_id: String,
    pub(crate) driver: String,
    pub(crate) charger: String,
    pub(crate) started_at: DateTime<Utc>,
    /// Monotonic start, used for ages and elapsed time
    pub(crate) started: Instant,
    accrual: Arc<Mutex<Accrual>>,
    ticks: Option<TickHandle>,
}

impl Session {
    pub(crate) fn new(driver: String, charger: String) -> Self {
        Self {
            session_id: new_session_id(),
            driver,
            charger,
            started_at: Utc::now(),
            started: Instant::now(),
            accrual: Arc::new(Mutex::new(Accrual::default())),
            ticks: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Begin periodic accrual. Any previous tick task is cancelled first.
    pub(crate) fn start_accrual(
        &mut self,
        ticker: Ticker,
        energy_step: f64,
        policy: PointsPolicy,
    ) {
        let accrual = Arc::clone(&self.accrual);
        let session_id = self.session_id.clone();
        self.stop_accrual();
        self.ticks = Some(ticker.spawn(move || {
            let mut accrual = lock(&accrual);
            accrual.apply_tick(energy_step, policy);
            trace!(
                %session_id,
                energy_kwh = accrual.energy_kwh,
                points = accrual.points,
                "accrual tick"
            );
        }));
    }

    /// Cancel the accrual task. Returns `false` if none was running.
    pub(crate) fn stop_accrual(&mut self) -> bool {
        self.ticks.as_mut().is_some_and(TickHandle::cancel)
    }

    pub fn is_accruing(&self) -> bool {
        self.ticks.as_ref().is_some_and(TickHandle::is_active)
    }

    /// Point-in-time copy of energy and points, taken under one lock.
    pub fn accrual(&self) -> Accrual {
        *lock(&self.accrual)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn to_status(&self, co2_kg_per_kwh: f64) -> SessionStatus {
        let accrual = self.accrual();
        SessionStatus {
            session_id: self.session_id.clone(),
            driver: self.driver.clone(),
            charger: self.charger.clone(),
            started_at: self.started_at,
            elapsed_ms: self.age(Instant::now()).as_millis() as u64,
            energy_kwh: accrual.energy_kwh,
            points: accrual.points,
            co2_saved_kg: accrual.energy_kwh * co2_kg_per_kwh,
        }
    }

    pub(crate) fn to_tally(&self) -> SessionTally {
        let accrual = self.accrual();
        SessionTally {
            session_id: self.session_id.clone(),
            driver: self.driver.clone(),
            charger: self.charger.clone(),
            energy_kwh: accrual.energy_kwh,
            points: accrual.points,
        }
    }
}

/// Live status of a session, including display-only derived metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub driver: String,
    pub charger: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub energy_kwh: f64,
    pub points: f64,
    /// Estimated emissions offset (display only)
    pub co2_saved_kg: f64,
}

/// Final values of a stopped session, to be handed to settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTally {
    pub session_id: String,
    pub driver: String,
    pub charger: String,
    pub energy_kwh: f64,
    pub points: f64,
}

/// Immutable record of a completed session kept in the recent buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSession {
    pub session_id: String,
    pub driver: String,
    pub charger: String,
    pub energy_kwh: f64,
    pub points: f64,
    pub completed_at: DateTime<Utc>,
}

impl CompletedSession {
    pub(crate) fn from_tally(tally: &SessionTally, completed_at: DateTime<Utc>) -> Self {
        Self {
            session_id: tally.session_id.clone(),
            driver: tally.driver.clone(),
            charger: tally.charger.clone(),
            energy_kwh: tally.energy_kwh,
            points: tally.points,
            completed_at,
        }
    }
}
