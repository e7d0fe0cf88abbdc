//! IPC protocol between the CLI client and the daemon
//!
//! Newline-delimited JSON over a Unix socket: one `Request` per line, one
//! `Response` line back.

use crate::error::TrackerError;
use crate::session::{CompletedSession, SessionStatus, SessionTally};
use crate::settlement::{DriverAccount, SessionRecord};
use crate::tracker::{Insights, StartedSession};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Socket name for IPC communication
pub const SOCKET_NAME: &str = "charge-tracker.sock";

/// Get the socket path for IPC communication
///
/// Uses XDG_RUNTIME_DIR if available, falls back to the temp dir
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    runtime_dir.join(SOCKET_NAME)
}

/// Request from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Start {
        driver: String,
        charger: String,
    },
    Status {
        session_id: String,
    },
    /// Stop the session, then hand the tally to settlement
    Stop {
        session_id: String,
        charger: String,
    },
    Live,
    Driver {
        driver: String,
    },
    Recent,
    /// Retry settlement of a tally returned by an earlier stop
    Settle {
        tally: SessionTally,
    },
    /// Ledger history of a driver, newest first
    History {
        driver: String,
    },
    Drivers,
    Insights,
}

/// Result of handing a stopped session to the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Committed { record: SessionRecord },
    Failed { message: String, retryable: bool },
}

/// Response from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Started(StartedSession),
    Status(SessionStatus),
    Stopped {
        tally: SessionTally,
        settlement: SettlementOutcome,
    },
    Settled {
        record: SessionRecord,
    },
    Live {
        sessions: Vec<SessionStatus>,
    },
    Recent {
        sessions: Vec<CompletedSession>,
    },
    History {
        driver: String,
        records: Vec<SessionRecord>,
    },
    Drivers {
        drivers: Vec<DriverAccount>,
    },
    Insights(Insights),
    Error {
        kind: String,
        status: u16,
        message: String,
    },
}

impl From<&TrackerError> for Response {
    fn from(err: &TrackerError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            status: err.status_code(),
            message: err.to_string(),
        }
    }
}

impl Response {
    /// Error response for a line that could not be parsed
    pub fn malformed(detail: impl std::fmt::Display) -> Self {
        Self::Error {
            kind: "validation".into(),
            status: 400,
            message: format!("invalid request: {detail}"),
        }
    }
}
