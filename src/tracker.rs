//! Session lifecycle: start, status, stop, settlement, listing and
//! stale-session reaping
//!
//! `SessionTracker` is the single owner of live-session state in the process.
//! It is cheap to clone; clones share the same registry.
//!
//! Stop only finalises bookkeeping and returns the tally. The tally is kept as
//! unsettled until [`SessionTracker::settle`] commits it to the settlement
//! collaborator; only tallies produced by a stop can be settled, and each one
//! at most once. Unsettled tallies live in memory only and are discarded on
//! shutdown.

use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError, require};
use crate::recent::RecentSessions;
use crate::registry::SessionRegistry;
use crate::session::{CompletedSession, Session, SessionStatus, SessionTally, lock};
use crate::settlement::{DriverAccount, SessionCommit, SessionRecord, Settlement};
use crate::ticker::{TickHandle, Ticker};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Returned by a successful start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedSession {
    pub session_id: String,
    /// Driver's price per point as registered with the ledger
    pub price_per_point: u64,
}

/// Platform-wide sustainability figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub total_energy: u64,
    pub co2_saved_kg: f64,
    pub total_sessions: u64,
    pub driver_count: u64,
}

struct Inner {
    config: TrackerConfig,
    registry: Mutex<SessionRegistry>,
    recent: Mutex<RecentSessions>,
    /// Stopped tallies not yet committed, by session id
    unsettled: Mutex<HashMap<String, SessionTally>>,
    settlement: Arc<dyn Settlement>,
    /// Serialises first-time driver registration
    registration: tokio::sync::Mutex<()>,
    reaper: Mutex<Option<TickHandle>>,
    /// Set once by shutdown, under the registry lock
    closed: AtomicBool,
}

/// Live charging-session tracker
#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<Inner>,
}

impl SessionTracker {
    /// Build a tracker, rejecting settings that would stall or reverse accrual.
    pub fn new(config: TrackerConfig, settlement: Arc<dyn Settlement>) -> Result<Self> {
        config.validate()?;
        let recent = RecentSessions::with_capacity(config.recent_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(SessionRegistry::new()),
                recent: Mutex::new(recent),
                unsettled: Mutex::new(HashMap::new()),
                settlement,
                registration: tokio::sync::Mutex::new(()),
                reaper: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Start a session for `driver` at `charger`.
    ///
    /// Registers the driver with the ledger first if it has never been seen.
    /// A collaborator failure aborts the start and is returned unchanged.
    pub async fn start(&self, driver: &str, charger: &str) -> Result<StartedSession> {
        require(driver, "driver")?;
        require(charger, "charger")?;
        if self.is_shut_down() {
            return Err(TrackerError::ShutDown);
        }

        // Cheap rejection before any ledger round-trip; put() re-checks atomically.
        let busy = lock(&self.inner.registry).has_driver(driver);
        if busy {
            return Err(TrackerError::Conflict {
                driver: driver.to_string(),
            });
        }

        let account = self.ensure_driver(driver).await?;

        let config = &self.inner.config;
        let mut session = Session::new(driver.to_string(), charger.to_string());
        session.start_accrual(
            Ticker::every(config.tick_period()),
            config.energy_step_kwh,
            config.points,
        );
        let session_id = session.session_id().to_string();
        {
            let mut registry = lock(&self.inner.registry);
            // Shutdown may have run while the ledger was being consulted.
            if self.is_shut_down() {
                return Err(TrackerError::ShutDown);
            }
            registry.put(session)?;
        }

        info!(%session_id, %driver, %charger, "session started");
        Ok(StartedSession {
            session_id,
            price_per_point: account.price_per_point,
        })
    }

    async fn ensure_driver(&self, driver: &str) -> Result<DriverAccount> {
        let settlement = &self.inner.settlement;
        if let Some(account) = settlement.find_driver(driver).await? {
            return Ok(account);
        }

        let _guard = self.inner.registration.lock().await;
        if let Some(account) = settlement.find_driver(driver).await? {
            return Ok(account);
        }
        info!(%driver, "registering new driver");
        let account = settlement
            .register_driver(driver, self.inner.config.default_price_per_point)
            .await?;
        Ok(account)
    }

    /// Point-in-time status of a live session
    pub fn status(&self, session_id: &str) -> Result<SessionStatus> {
        require(session_id, "session_id")?;
        let registry = lock(&self.inner.registry);
        let session = registry.get_by_id(session_id)?;
        Ok(session.to_status(self.inner.config.co2_kg_per_kwh))
    }

    /// Stop a live session and return its final tally.
    ///
    /// Exactly one of concurrent stop/reap calls on the same session wins;
    /// the others see `NotFound`. The tally stays unsettled until
    /// [`settle`](Self::settle) commits it.
    pub fn stop(&self, session_id: &str, charger: &str) -> Result<SessionTally> {
        require(session_id, "session_id")?;
        require(charger, "charger")?;

        let session = lock(&self.inner.registry).remove(session_id)?;
        if session.charger != charger {
            warn!(
                %session_id,
                start_charger = %session.charger,
                stop_charger = %charger,
                "charger changed between start and stop"
            );
        }
        let mut tally = session.to_tally();
        tally.charger = charger.to_string();
        drop(session);

        lock(&self.inner.recent).push(CompletedSession::from_tally(&tally, Utc::now()));
        lock(&self.inner.unsettled).insert(tally.session_id.clone(), tally.clone());
        info!(
            %session_id,
            driver = %tally.driver,
            energy_kwh = tally.energy_kwh,
            points = tally.points,
            "session stopped"
        );
        Ok(tally)
    }

    /// Commit a stopped session's tally to the ledger.
    ///
    /// Only a tally returned by [`stop`](Self::stop) and not yet committed is
    /// accepted; the ledger receives the values recorded at stop. A failed
    /// commit leaves the tally unsettled so it can be retried.
    pub async fn settle(&self, tally: &SessionTally) -> Result<SessionRecord> {
        require(&tally.session_id, "session_id")?;
        if !tally.energy_kwh.is_finite() || tally.energy_kwh < 0.0 {
            return Err(TrackerError::Invalid {
                field: "energy_kwh",
                reason: "must be a non-negative number",
            });
        }

        // Claimed while committing so a concurrent retry cannot commit twice.
        let stopped = lock(&self.inner.unsettled)
            .remove(&tally.session_id)
            .ok_or_else(|| TrackerError::unsettled_not_found(&tally.session_id))?;
        if stopped.driver != tally.driver {
            let session_id = stopped.session_id.clone();
            lock(&self.inner.unsettled).insert(session_id, stopped);
            return Err(TrackerError::Invalid {
                field: "driver",
                reason: "does not match the stopped session",
            });
        }

        let commit = SessionCommit {
            driver: stopped.driver.clone(),
            charger: stopped.charger.clone(),
            energy_units: self.inner.config.to_ledger_units(stopped.energy_kwh),
        };
        match self.inner.settlement.commit_session(commit).await {
            Ok(record) => {
                info!(
                    session_id = %stopped.session_id,
                    record_id = record.record_id,
                    "session settled"
                );
                Ok(record)
            }
            Err(e) => {
                warn!(
                    session_id = %stopped.session_id,
                    driver = %stopped.driver,
                    energy_kwh = stopped.energy_kwh,
                    "settlement failed, caller must retry: {e}"
                );
                let session_id = stopped.session_id.clone();
                lock(&self.inner.unsettled).insert(session_id, stopped);
                Err(TrackerError::Collaborator(e))
            }
        }
    }

    /// Tallies stopped but not yet committed
    pub fn unsettled_count(&self) -> usize {
        lock(&self.inner.unsettled).len()
    }

    /// Status of every live session
    pub fn list_live(&self) -> Vec<SessionStatus> {
        lock(&self.inner.registry).list_all(self.inner.config.co2_kg_per_kwh)
    }

    /// Status of the driver's live session
    pub fn get_by_driver(&self, driver: &str) -> Result<SessionStatus> {
        require(driver, "driver")?;
        let registry = lock(&self.inner.registry);
        let session = registry.get_by_driver(driver)?;
        Ok(session.to_status(self.inner.config.co2_kg_per_kwh))
    }

    /// Recently completed sessions, most recent first
    pub fn list_recent(&self) -> Vec<CompletedSession> {
        lock(&self.inner.recent).list_all()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    /// Sessions the ledger recorded for `driver`, newest first
    pub async fn driver_history(&self, driver: &str) -> Result<Vec<SessionRecord>> {
        require(driver, "driver")?;
        Ok(self.inner.settlement.driver_history(driver).await?)
    }

    /// Every driver registered with the ledger
    pub async fn drivers(&self) -> Result<Vec<DriverAccount>> {
        Ok(self.inner.settlement.list_drivers().await?)
    }

    /// Ledger-wide energy, CO2 offset and session counts
    pub async fn insights(&self) -> Result<Insights> {
        let totals = self.inner.settlement.totals().await?;
        Ok(Insights {
            total_energy: totals.total_energy,
            co2_saved_kg: totals.total_energy as f64 * self.inner.config.co2_kg_per_kwh,
            total_sessions: totals.total_sessions,
            driver_count: totals.driver_count,
        })
    }

    /// Remove every session older than the retention threshold.
    ///
    /// Reaped sessions skip settlement and the recent buffer. Each removal is
    /// independent: a session already gone (stopped concurrently) is skipped.
    pub fn sweep_stale(&self) -> Vec<String> {
        let retention = self.inner.config.retention();
        let candidates = lock(&self.inner.registry).stale_ids(retention, Instant::now());

        let mut reaped = Vec::with_capacity(candidates.len());
        for session_id in candidates {
            let removed = lock(&self.inner.registry).remove(&session_id);
            match removed {
                Ok(session) => {
                    let accrual = session.accrual();
                    info!(
                        %session_id,
                        driver = %session.driver(),
                        energy_kwh = accrual.energy_kwh,
                        points = accrual.points,
                        "reaped stale session"
                    );
                    reaped.push(session_id);
                }
                Err(e) => debug!(%session_id, "skipped reaping: {e}"),
            }
        }
        if !reaped.is_empty() {
            debug!("{} live session(s) after sweep", self.live_count());
        }
        reaped
    }

    /// Start the periodic stale-session sweep. Replaces a running reaper.
    ///
    /// Does nothing once the tracker is shut down. Must be called from within
    /// a tokio runtime.
    pub fn spawn_reaper(&self) {
        let mut reaper = lock(&self.inner.reaper);
        if self.is_shut_down() {
            debug!("tracker shut down, reaper not started");
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let handle = Ticker::every(self.inner.config.reaper_interval()).spawn(move || {
            if let Some(inner) = weak.upgrade() {
                SessionTracker { inner }.sweep_stale();
            }
        });
        *reaper = Some(handle);
    }

    pub fn reaper_running(&self) -> bool {
        lock(&self.inner.reaper)
            .as_ref()
            .is_some_and(TickHandle::is_active)
    }

    /// Cancel the reaper and every accrual task, dropping all live sessions.
    ///
    /// Later starts fail with `ShutDown`. Unsettled tallies are discarded.
    pub fn shutdown(&self) {
        let drained = {
            let mut registry = lock(&self.inner.registry);
            self.inner.closed.store(true, Ordering::SeqCst);
            registry.drain()
        };
        if let Some(mut reaper) = lock(&self.inner.reaper).take() {
            reaper.cancel();
        }
        for session in &drained {
            debug!(session_id = %session.session_id(), "discarding live session");
        }

        let unsettled: Vec<_> = lock(&self.inner.unsettled).drain().map(|(id, _)| id).collect();
        if !unsettled.is_empty() {
            warn!(?unsettled, "discarding unsettled tallies");
        }
        info!(discarded = drained.len(), "tracker shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PointsPolicy;
    use crate::settlement::{InMemoryLedger, LedgerTotals, SettlementError};
    use async_trait::async_trait;
    use std::time::Duration;

    const STEP: f64 = 0.05;

    fn config() -> TrackerConfig {
        TrackerConfig {
            energy_step_kwh: STEP,
            points: PointsPolicy::PerEnergyUnit { rate: 100.0 },
            recent_capacity: 3,
            ..TrackerConfig::default()
        }
    }

    fn tracker_with(config: TrackerConfig) -> (SessionTracker, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let tracker = SessionTracker::new(config, ledger.clone()).unwrap();
        (tracker, ledger)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// Ledger whose lookups take a while and which can be told to fail.
    struct SlowLedger {
        inner: InMemoryLedger,
        delay: Duration,
        fail_register: bool,
        fail_commit: AtomicBool,
    }

    impl SlowLedger {
        fn new(delay: Duration) -> Self {
            Self {
                inner: InMemoryLedger::new(),
                delay,
                fail_register: false,
                fail_commit: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Settlement for SlowLedger {
        async fn find_driver(
            &self,
            driver: &str,
        ) -> std::result::Result<Option<DriverAccount>, SettlementError> {
            tokio::time::sleep(self.delay).await;
            self.inner.find_driver(driver).await
        }

        async fn register_driver(
            &self,
            driver: &str,
            price_per_point: u64,
        ) -> std::result::Result<DriverAccount, SettlementError> {
            tokio::time::sleep(self.delay).await;
            if self.fail_register {
                return Err(SettlementError::Unavailable("rpc timeout".into()));
            }
            self.inner.register_driver(driver, price_per_point).await
        }

        async fn commit_session(
            &self,
            commit: SessionCommit,
        ) -> std::result::Result<SessionRecord, SettlementError> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(SettlementError::Unavailable("rpc timeout".into()));
            }
            self.inner.commit_session(commit).await
        }

        async fn driver_history(
            &self,
            driver: &str,
        ) -> std::result::Result<Vec<SessionRecord>, SettlementError> {
            self.inner.driver_history(driver).await
        }

        async fn list_drivers(&self) -> std::result::Result<Vec<DriverAccount>, SettlementError> {
            self.inner.list_drivers().await
        }

        async fn totals(&self) -> std::result::Result<LedgerTotals, SettlementError> {
            self.inner.totals().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_status_stop_scenario() {
        let (tracker, ledger) = tracker_with(config());

        let started = tracker.start("D1", "C1").await.unwrap();
        assert_eq!(started.price_per_point, 100);
        assert_eq!(ledger.list_drivers().await.unwrap().len(), 1);

        let status = tracker.status(&started.session_id).unwrap();
        assert_eq!(status.energy_kwh, 0.0);
        assert_eq!(status.points, 0.0);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let status = tracker.status(&started.session_id).unwrap();
        assert!(approx(status.energy_kwh, 3.0 * STEP));
        assert!(approx(status.co2_saved_kg, 3.0 * STEP * 0.5));

        let tally = tracker.stop(&started.session_id, "C1").unwrap();
        assert!(approx(tally.energy_kwh, 3.0 * STEP));
        assert!(approx(tally.points, 3.0 * STEP * 100.0));
        assert_eq!(tally.driver, "D1");

        assert!(matches!(
            tracker.status(&started.session_id),
            Err(TrackerError::NotFound { .. })
        ));
        let recent = tracker.list_recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].charger, "C1");
        assert_eq!(recent[0].session_id, started.session_id);
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn known_driver_is_not_registered_again() {
        let (tracker, ledger) = tracker_with(config());
        ledger.register_driver("D1", 250).await.unwrap();

        let started = tracker.start("D1", "C1").await.unwrap();
        assert_eq!(started.price_per_point, 250);
        assert_eq!(ledger.list_drivers().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_for_driver_conflicts() {
        let (tracker, _ledger) = tracker_with(config());
        tracker.start("D1", "C1").await.unwrap();

        let err = tracker.start("D1", "C2").await.unwrap_err();
        assert!(matches!(err, TrackerError::Conflict { .. }));
        assert_eq!(tracker.live_count(), 1);
        assert_eq!(tracker.get_by_driver("D1").unwrap().charger, "C1");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_for_same_driver() {
        let ledger = Arc::new(SlowLedger::new(Duration::from_millis(200)));
        let tracker = SessionTracker::new(config(), ledger.clone()).unwrap();

        let (a, b) = tokio::join!(tracker.start("D1", "C1"), tracker.start("D1", "C2"));
        let results = [a, b];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(TrackerError::Conflict { .. })))
            .count();
        assert_eq!((ok, conflicts), (1, 1));
        assert_eq!(tracker.live_count(), 1);
        assert_eq!(ledger.inner.list_drivers().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn registration_failure_aborts_start() {
        let ledger = Arc::new(SlowLedger {
            fail_register: true,
            ..SlowLedger::new(Duration::from_millis(10))
        });
        let tracker = SessionTracker::new(config(), ledger).unwrap();

        let err = tracker.start("D1", "C1").await.unwrap_err();
        match err {
            TrackerError::Collaborator(cause) => {
                assert_eq!(cause, SettlementError::Unavailable("rpc timeout".into()))
            }
            other => panic!("expected collaborator error, got {other:?}"),
        }
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test]
    async fn missing_arguments_are_validation_errors() {
        let (tracker, ledger) = tracker_with(config());
        assert!(matches!(
            tracker.start("", "C1").await,
            Err(TrackerError::Validation { field: "driver" })
        ));
        assert!(matches!(
            tracker.start("D1", " ").await,
            Err(TrackerError::Validation { field: "charger" })
        ));
        assert!(matches!(
            tracker.stop("abc", ""),
            Err(TrackerError::Validation { field: "charger" })
        ));
        assert!(matches!(
            tracker.stop("", "C1"),
            Err(TrackerError::Validation { field: "session_id" })
        ));
        assert!(ledger.list_drivers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_unknown_session_changes_nothing() {
        let (tracker, _ledger) = tracker_with(config());
        tracker.start("D1", "C1").await.unwrap();

        let err = tracker.stop("does-not-exist", "C1").unwrap_err();
        assert!(matches!(err, TrackerError::NotFound { .. }));
        assert_eq!(tracker.live_count(), 1);
        assert!(tracker.list_recent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_twice_is_not_found() {
        let (tracker, _ledger) = tracker_with(config());
        let started = tracker.start("D1", "C1").await.unwrap();

        tracker.stop(&started.session_id, "C1").unwrap();
        assert!(matches!(
            tracker.stop(&started.session_id, "C1"),
            Err(TrackerError::NotFound { .. })
        ));
        assert_eq!(tracker.list_recent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accrual_is_non_decreasing() {
        let (tracker, _ledger) = tracker_with(config());
        let started = tracker.start("D1", "C1").await.unwrap();

        let mut last = tracker.status(&started.session_id).unwrap();
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(370)).await;
            let now = tracker.status(&started.session_id).unwrap();
            assert!(now.energy_kwh >= last.energy_kwh);
            assert!(now.points >= last.points);
            assert!(now.elapsed_ms >= last.elapsed_ms);
            last = now;
        }
        assert!(last.energy_kwh > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn flat_points_policy() {
        let (tracker, _ledger) = tracker_with(TrackerConfig {
            points: PointsPolicy::FlatPerTick { points: 4.0 },
            ..config()
        });
        let started = tracker.start("D1", "C1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let tally = tracker.stop(&started.session_id, "C1").unwrap();
        assert_eq!(tally.points, 8.0);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_keeps_last_capacity_stops() {
        let (tracker, _ledger) = tracker_with(config());
        let mut ids = Vec::new();
        for n in 0..5 {
            let driver = format!("D{n}");
            let started = tracker.start(&driver, "C1").await.unwrap();
            tracker.stop(&started.session_id, "C1").unwrap();
            ids.push(started.session_id);
        }

        let recent: Vec<_> = tracker
            .list_recent()
            .into_iter()
            .map(|e| e.session_id)
            .collect();
        let expected: Vec<_> = ids.iter().rev().take(3).cloned().collect();
        assert_eq!(recent, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_drivers_never_share_a_slot() {
        let (tracker, _ledger) = tracker_with(config());
        let mut live = Vec::new();
        for round in 0..3 {
            for n in 0..4 {
                let driver = format!("D{n}");
                match tracker.start(&driver, "C1").await {
                    Ok(started) => live.push(started.session_id),
                    Err(TrackerError::Conflict { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            if round % 2 == 0 {
                if let Some(id) = live.pop() {
                    tracker.stop(&id, "C1").unwrap();
                }
            }

            let mut drivers: Vec<_> = tracker.list_live().into_iter().map(|s| s.driver).collect();
            let total = drivers.len();
            drivers.sort();
            drivers.dedup();
            assert_eq!(drivers.len(), total);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn get_by_driver_and_list_live() {
        let (tracker, _ledger) = tracker_with(config());
        let a = tracker.start("D1", "C1").await.unwrap();
        tracker.start("D2", "C2").await.unwrap();

        assert_eq!(tracker.get_by_driver("D1").unwrap().session_id, a.session_id);
        assert!(matches!(
            tracker.get_by_driver("D3"),
            Err(TrackerError::NotFound { .. })
        ));
        assert_eq!(tracker.list_live().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_stale_sessions_without_recording() {
        let (tracker, _ledger) = tracker_with(TrackerConfig {
            retention_secs: 10,
            reaper_interval_secs: 5,
            ..config()
        });
        let old = tracker.start("D1", "C1").await.unwrap();
        tracker.spawn_reaper();
        assert!(tracker.reaper_running());

        tokio::time::sleep(Duration::from_secs(8)).await;
        let fresh = tracker.start("D2", "C1").await.unwrap();

        // Sweeps at 5s, 10s and 15s; only the first session is past 10s at 15s.
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        assert!(matches!(
            tracker.status(&old.session_id),
            Err(TrackerError::NotFound { .. })
        ));
        assert!(tracker.status(&fresh.session_id).is_ok());
        assert!(tracker.list_recent().is_empty());
        assert!(
            tracker
                .list_live()
                .iter()
                .all(|s| s.session_id != old.session_id)
        );

        // Driver may start again after being reaped.
        tracker.start("D1", "C3").await.unwrap();
        tracker.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_returns_reaped_ids() {
        let (tracker, _ledger) = tracker_with(TrackerConfig {
            retention_secs: 60,
            ..config()
        });
        let started = tracker.start("D1", "C1").await.unwrap();

        assert!(tracker.sweep_stale().is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.sweep_stale(), vec![started.session_id.clone()]);
        assert!(tracker.sweep_stale().is_empty());

        // A later stop loses the race and sees NotFound.
        assert!(matches!(
            tracker.stop(&started.session_id, "C1"),
            Err(TrackerError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let (tracker, _ledger) = tracker_with(config());
        let a = tracker.start("D1", "C1").await.unwrap();
        tracker.start("D2", "C1").await.unwrap();
        tracker.spawn_reaper();

        tracker.shutdown();
        assert!(!tracker.reaper_running());
        assert_eq!(tracker.live_count(), 0);
        assert!(tracker.list_recent().is_empty());
        assert!(matches!(
            tracker.status(&a.session_id),
            Err(TrackerError::NotFound { .. })
        ));
    }

    #[test]
    fn rejects_configs_that_break_accrual() {
        let bad = [
            TrackerConfig {
                tick_period_ms: 0,
                ..config()
            },
            TrackerConfig {
                energy_step_kwh: -1.0,
                ..config()
            },
            TrackerConfig {
                reaper_interval_secs: 0,
                ..config()
            },
        ];
        for config in bad {
            let ledger = Arc::new(InMemoryLedger::new());
            assert!(matches!(
                SessionTracker::new(config, ledger),
                Err(TrackerError::Config(_))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settle_commits_a_stopped_tally_once() {
        let (tracker, ledger) = tracker_with(config());
        let started = tracker.start("D1", "C1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let tally = tracker.stop(&started.session_id, "C2").unwrap();
        assert_eq!(tracker.unsettled_count(), 1);

        let record = tracker.settle(&tally).await.unwrap();
        assert_eq!(record.driver, "D1");
        assert_eq!(record.charger, "C2");
        assert_eq!(tracker.unsettled_count(), 0);

        assert!(matches!(
            tracker.settle(&tally).await,
            Err(TrackerError::NotFound { .. })
        ));
        let totals = ledger.totals().await.unwrap();
        assert_eq!(totals.total_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_rejects_tallies_not_produced_by_stop() {
        let (tracker, ledger) = tracker_with(config());
        tracker.start("D1", "C1").await.unwrap();

        let forged = SessionTally {
            session_id: "never-existed".into(),
            driver: "D1".into(),
            charger: "C1".into(),
            energy_kwh: 1e6,
            points: 1e8,
        };
        assert!(matches!(
            tracker.settle(&forged).await,
            Err(TrackerError::NotFound { .. })
        ));

        for energy_kwh in [f64::NAN, f64::INFINITY, -0.5] {
            let bad = SessionTally {
                energy_kwh,
                ..forged.clone()
            };
            assert!(matches!(
                tracker.settle(&bad).await,
                Err(TrackerError::Invalid {
                    field: "energy_kwh",
                    ..
                })
            ));
        }
        assert_eq!(ledger.totals().await.unwrap().total_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_commits_recorded_energy_not_submitted() {
        let (tracker, ledger) = tracker_with(config());
        let started = tracker.start("D1", "C1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let tally = tracker.stop(&started.session_id, "C1").unwrap();

        let mismatched = SessionTally {
            driver: "D2".into(),
            ..tally.clone()
        };
        assert!(matches!(
            tracker.settle(&mismatched).await,
            Err(TrackerError::Invalid { field: "driver", .. })
        ));
        assert_eq!(tracker.unsettled_count(), 1);

        let inflated = SessionTally {
            energy_kwh: 500.0,
            ..tally.clone()
        };
        tracker.settle(&inflated).await.unwrap();
        let account = ledger.find_driver("D1").await.unwrap().unwrap();
        // 0.15 kWh at 100 000 units/kWh, recorded per 1 000 units
        assert_eq!(account.total_energy, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_settlement_can_be_retried() {
        let ledger = Arc::new(SlowLedger::new(Duration::ZERO));
        let tracker = SessionTracker::new(config(), ledger.clone()).unwrap();
        let started = tracker.start("D1", "C1").await.unwrap();
        let tally = tracker.stop(&started.session_id, "C1").unwrap();

        ledger.fail_commit.store(true, Ordering::SeqCst);
        match tracker.settle(&tally).await {
            Err(TrackerError::Collaborator(cause)) => assert!(cause.retryable()),
            other => panic!("expected collaborator error, got {other:?}"),
        }
        assert_eq!(tracker.unsettled_count(), 1);

        ledger.fail_commit.store(false, Ordering::SeqCst);
        tracker.settle(&tally).await.unwrap();
        assert_eq!(tracker.unsettled_count(), 0);
        assert_eq!(ledger.inner.totals().await.unwrap().total_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_queries() {
        let (tracker, _ledger) = tracker_with(config());
        for driver in ["D2", "D1"] {
            let started = tracker.start(driver, "C1").await.unwrap();
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            let tally = tracker.stop(&started.session_id, "C1").unwrap();
            tracker.settle(&tally).await.unwrap();
        }

        let drivers: Vec<_> = tracker
            .drivers()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.driver)
            .collect();
        assert_eq!(drivers, ["D1", "D2"]);

        let history = tracker.driver_history("D1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(matches!(
            tracker.driver_history("D9").await,
            Err(TrackerError::Collaborator(SettlementError::UnknownDriver(_)))
        ));

        let insights = tracker.insights().await.unwrap();
        assert_eq!(insights.total_sessions, 2);
        assert_eq!(insights.driver_count, 2);
        assert_eq!(insights.total_energy, 20);
        assert!(approx(insights.co2_saved_kg, 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn no_new_work_after_shutdown() {
        let (tracker, _ledger) = tracker_with(config());
        tracker.shutdown();
        assert!(tracker.is_shut_down());

        assert!(matches!(
            tracker.start("D1", "C1").await,
            Err(TrackerError::ShutDown)
        ));
        tracker.spawn_reaper();
        assert!(!tracker.reaper_running());
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_in_flight_during_shutdown_is_dropped() {
        let ledger = Arc::new(SlowLedger::new(Duration::from_millis(200)));
        let tracker = SessionTracker::new(config(), ledger).unwrap();

        let pending = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.start("D1", "C1").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracker.shutdown();

        assert!(matches!(pending.await.unwrap(), Err(TrackerError::ShutDown)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tracker.live_count(), 0);
        assert!(tracker.list_live().is_empty());
    }
}
