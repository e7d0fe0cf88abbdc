//! Tracker configuration (accrual policy, reaper cadence, buffer sizes).
//!
//! Persisted as `config.json` in the platform config directory
//! (`~/.config/charge-tracker/` on Linux). A missing or unreadable file
//! yields the defaults below, which match the reference deployment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Points policy
// ---------------------------------------------------------------------------

/// How reward points grow on each accrual tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PointsPolicy {
    /// `points += rate * energy_step` on every tick
    PerEnergyUnit { rate: f64 },
    /// `points += points` on every tick regardless of energy
    FlatPerTick { points: f64 },
}

impl PointsPolicy {
    /// Points earned by one tick that added `energy_step` kWh.
    pub fn points_for(&self, energy_step: f64) -> f64 {
        match *self {
            Self::PerEnergyUnit { rate } => rate * energy_step,
            Self::FlatPerTick { points } => points,
        }
    }

    fn is_valid(&self) -> bool {
        let v = match *self {
            Self::PerEnergyUnit { rate } => rate,
            Self::FlatPerTick { points } => points,
        };
        v.is_finite() && v >= 0.0
    }
}

impl Default for PointsPolicy {
    fn default() -> Self {
        Self::PerEnergyUnit { rate: 100.0 }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tracker settings (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Accrual tick period in milliseconds.
    pub tick_period_ms: u64,
    /// Simulated energy added per tick, in kWh.
    pub energy_step_kwh: f64,
    pub points: PointsPolicy,
    /// kg of CO2 offset per kWh, display only.
    pub co2_kg_per_kwh: f64,
    /// How often the reaper sweeps, in seconds.
    pub reaper_interval_secs: u64,
    /// Sessions older than this are reaped, in seconds.
    pub retention_secs: u64,
    /// Capacity of the recently-completed ring buffer.
    pub recent_capacity: usize,
    /// Price per point assigned when a driver is first registered.
    pub default_price_per_point: u64,
    /// Ledger units per kWh used when handing energy to settlement.
    pub ledger_units_per_kwh: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 1_000,
            energy_step_kwh: 0.05,
            points: PointsPolicy::default(),
            co2_kg_per_kwh: 0.5,
            reaper_interval_secs: 60 * 60,
            retention_secs: 12 * 60 * 60,
            recent_capacity: 50,
            default_price_per_point: 100,
            ledger_units_per_kwh: 100_000,
        }
    }
}

/// Rejected configuration value
#[derive(Debug, thiserror::Error)]
#[error("invalid config: {0}")]
pub struct ConfigError(String);

impl TrackerConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Convert canonical kWh into the collaborator's integer ledger units.
    pub fn to_ledger_units(&self, energy_kwh: f64) -> u64 {
        (energy_kwh * self.ledger_units_per_kwh as f64).floor() as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period_ms == 0 {
            return Err(ConfigError("tick_period_ms must be positive".into()));
        }
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError("reaper_interval_secs must be positive".into()));
        }
        if self.recent_capacity == 0 {
            return Err(ConfigError("recent_capacity must be positive".into()));
        }
        if !self.energy_step_kwh.is_finite() || self.energy_step_kwh < 0.0 {
            return Err(ConfigError(
                "energy_step_kwh must be a non-negative number".into(),
            ));
        }
        if !self.points.is_valid() {
            return Err(ConfigError("points policy must be non-negative".into()));
        }
        if !self.co2_kg_per_kwh.is_finite() || self.co2_kg_per_kwh < 0.0 {
            return Err(ConfigError(
                "co2_kg_per_kwh must be a non-negative number".into(),
            ));
        }
        if self.ledger_units_per_kwh == 0 {
            return Err(ConfigError("ledger_units_per_kwh must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

/// Config directory (e.g. `~/.config/charge-tracker/`).
fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("charge-tracker"))
}

/// Default location of config.json.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default location, returning defaults if missing or invalid.
pub fn load_config() -> TrackerConfig {
    let Some(path) = default_config_path() else {
        return TrackerConfig::default();
    };
    load_config_from(&path)
}

/// Load config from `path`, returning defaults if missing or invalid.
pub fn load_config_from(path: &Path) -> TrackerConfig {
    let loaded = match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str::<TrackerConfig>(&contents).unwrap_or_default(),
        Err(_) => TrackerConfig::default(),
    };
    match loaded.validate() {
        Ok(()) => loaded,
        Err(e) => {
            tracing::warn!(path = %path.display(), "{e}, using defaults");
            TrackerConfig::default()
        }
    }
}

/// Save config to `path`, creating parent directories.
pub fn save_config_to(config: &TrackerConfig, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
