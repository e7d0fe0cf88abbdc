//! Settlement collaborator contract
//!
//! The ledger that durably records completed sessions and mints rewards lives
//! outside this process. The tracker needs it to look a driver up, register a
//! driver once and commit a finished session, plus a few read-only queries
//! (per-driver history, the driver list, platform totals).
//!
//! [`InMemoryLedger`] is a process-local implementation with the same
//! accounting rules as the on-chain program. The daemon uses it when no
//! external ledger is wired in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::session::lock;

/// Smallest reward units minted per ledger energy unit
pub const POINTS_PER_ENERGY_UNIT: u64 = 1_000_000;

/// Ledger energy units per kWh as stored on a committed session record
const ENERGY_UNITS_PER_RECORDED_KWH: u64 = 1_000;

/// Maximum number of history entries returned per driver
pub const HISTORY_LIMIT: usize = 10;

/// Errors reported by the settlement collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettlementError {
    /// Ledger could not be reached (network, timeout)
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// Ledger refused the request
    #[error("ledger rejected request: {0}")]
    Rejected(String),
    /// Commit for a driver that was never registered
    #[error("driver {0} is not registered")]
    UnknownDriver(String),
}

impl SettlementError {
    /// Whether retrying the same call may succeed
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Driver account as known to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverAccount {
    pub driver: String,
    pub total_energy: u64,
    pub total_points: u64,
    pub session_count: u64,
    pub price_per_point: u64,
    pub active: bool,
}

impl DriverAccount {
    fn new(driver: &str, price_per_point: u64) -> Self {
        Self {
            driver: driver.to_string(),
            total_energy: 0,
            total_points: 0,
            session_count: 0,
            price_per_point,
            active: true,
        }
    }
}

/// A finished session to record, energy already converted to ledger units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCommit {
    pub driver: String,
    pub charger: String,
    pub energy_units: u64,
}

/// What the ledger recorded for a committed session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub record_id: u64,
    pub driver: String,
    pub charger: String,
    pub energy_used: u64,
    pub points_minted: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Platform-wide counters kept by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    /// Sum of recorded energy over all driver accounts
    pub total_energy: u64,
    pub total_sessions: u64,
    pub driver_count: u64,
}

/// External ledger that registers drivers and records completed sessions
#[async_trait]
pub trait Settlement: Send + Sync {
    async fn find_driver(&self, driver: &str) -> Result<Option<DriverAccount>, SettlementError>;

    async fn register_driver(
        &self,
        driver: &str,
        price_per_point: u64,
    ) -> Result<DriverAccount, SettlementError>;

    async fn commit_session(&self, commit: SessionCommit) -> Result<SessionRecord, SettlementError>;

    /// A driver's recorded sessions, newest first, at most [`HISTORY_LIMIT`].
    async fn driver_history(&self, driver: &str) -> Result<Vec<SessionRecord>, SettlementError>;

    /// Every registered driver account, ordered by driver id
    async fn list_drivers(&self) -> Result<Vec<DriverAccount>, SettlementError>;

    async fn totals(&self) -> Result<LedgerTotals, SettlementError>;
}

#[derive(Debug, Default)]
struct LedgerState {
    drivers: HashMap<String, DriverAccount>,
    records: Vec<SessionRecord>,
}

/// Process-local ledger
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Settlement for InMemoryLedger {
    async fn find_driver(&self, driver: &str) -> Result<Option<DriverAccount>, SettlementError> {
        Ok(lock(&self.state).drivers.get(driver).cloned())
    }

    async fn register_driver(
        &self,
        driver: &str,
        price_per_point: u64,
    ) -> Result<DriverAccount, SettlementError> {
        let mut state = lock(&self.state);
        if state.drivers.contains_key(driver) {
            return Err(SettlementError::Rejected(format!(
                "driver {driver} already registered"
            )));
        }
        let account = DriverAccount::new(driver, price_per_point);
        state.drivers.insert(driver.to_string(), account.clone());
        info!(%driver, price_per_point, "ledger registered driver");
        Ok(account)
    }

    async fn commit_session(&self, commit: SessionCommit) -> Result<SessionRecord, SettlementError> {
        let points = commit
            .energy_units
            .checked_mul(POINTS_PER_ENERGY_UNIT)
            .ok_or_else(|| SettlementError::Rejected("points overflow".into()))?;
        let energy_used = commit.energy_units / ENERGY_UNITS_PER_RECORDED_KWH;

        let mut state = lock(&self.state);
        let record_id = state.records.len() as u64 + 1;
        let account = state
            .drivers
            .get_mut(&commit.driver)
            .ok_or_else(|| SettlementError::UnknownDriver(commit.driver.clone()))?;

        account.total_points = account
            .total_points
            .checked_add(points)
            .ok_or_else(|| SettlementError::Rejected("total points overflow".into()))?;
        account.total_energy = account.total_energy.saturating_add(energy_used);
        account.session_count += 1;

        let record = SessionRecord {
            record_id,
            driver: commit.driver,
            charger: commit.charger,
            energy_used,
            points_minted: points,
            recorded_at: Utc::now(),
        };
        state.records.push(record.clone());
        info!(driver = %record.driver, points, "ledger recorded session");
        Ok(record)
    }

    async fn driver_history(&self, driver: &str) -> Result<Vec<SessionRecord>, SettlementError> {
        let state = lock(&self.state);
        if !state.drivers.contains_key(driver) {
            return Err(SettlementError::UnknownDriver(driver.to_string()));
        }
        Ok(state
            .records
            .iter()
            .rev()
            .filter(|r| r.driver == driver)
            .take(HISTORY_LIMIT)
            .cloned()
            .collect())
    }

    async fn list_drivers(&self) -> Result<Vec<DriverAccount>, SettlementError> {
        let mut drivers: Vec<_> = lock(&self.state).drivers.values().cloned().collect();
        drivers.sort_by(|a, b| a.driver.cmp(&b.driver));
        Ok(drivers)
    }

    async fn totals(&self) -> Result<LedgerTotals, SettlementError> {
        let state = lock(&self.state);
        Ok(LedgerTotals {
            total_energy: state.drivers.values().map(|d| d.total_energy).sum(),
            total_sessions: state.records.len() as u64,
            driver_count: state.drivers.len() as u64,
        })
    }
}
