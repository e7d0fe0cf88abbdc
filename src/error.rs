//! Error types for tracker operations
//!
//! Every variant maps to a stable `kind()` code and an HTTP-style status so the
//! boundary (IPC server, or an outer HTTP layer) can turn it into a structured
//! response without string matching.

use crate::config::ConfigError;
use crate::settlement::SettlementError;
use thiserror::Error;

/// Result type alias for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors surfaced by the session tracker
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Missing or malformed required field
    #[error("{field} is required")]
    Validation { field: &'static str },

    /// Field present but out of range
    #[error("{field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    /// Driver already has an active session
    #[error("driver {driver} already has an active session")]
    Conflict { driver: String },

    /// Unknown session id, or no live session for a driver
    #[error("{what} not found")]
    NotFound { what: String },

    /// Settlement collaborator call failed
    #[error("settlement collaborator failed: {0}")]
    Collaborator(#[source] SettlementError),

    /// Tracker constructed with settings that would break accrual
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Tracker has been shut down and accepts no new sessions
    #[error("tracker is shut down")]
    ShutDown,
}

impl TrackerError {
    pub(crate) fn session_not_found(session_id: &str) -> Self {
        Self::NotFound {
            what: format!("session {session_id}"),
        }
    }

    pub(crate) fn driver_not_found(driver: &str) -> Self {
        Self::NotFound {
            what: format!("active session for driver {driver}"),
        }
    }

    pub(crate) fn unsettled_not_found(session_id: &str) -> Self {
        Self::NotFound {
            what: format!("unsettled session {session_id}"),
        }
    }

    /// Stable error code for programmatic handling
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::Invalid { .. } => "validation",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Collaborator(_) => "collaborator",
            Self::Config(_) => "config",
            Self::ShutDown => "shut_down",
        }
    }

    /// HTTP status an outer layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::Invalid { .. } => 400,
            Self::Conflict { .. } => 409,
            Self::NotFound { .. } => 404,
            Self::Collaborator(_) => 502,
            Self::Config(_) => 500,
            Self::ShutDown => 503,
        }
    }
}

impl From<SettlementError> for TrackerError {
    fn from(err: SettlementError) -> Self {
        Self::Collaborator(err)
    }
}

/// Reject a missing or blank required argument.
pub(crate) fn require(value: &str, field: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TrackerError::Validation { field });
    }
    Ok(())
}
