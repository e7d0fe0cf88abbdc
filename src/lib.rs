//! Charge tracker — live EV charging sessions with reward accrual
//!
//! Tracks in-memory charging sessions, accrues simulated energy and reward
//! points on a fixed tick, and hands final tallies off to a settlement ledger.

pub mod client;
pub mod config;
pub mod error;
pub mod ipc;
pub mod recent;
pub mod registry;
pub mod server;
pub mod session;
pub mod settlement;
pub mod ticker;
pub mod tracker;

pub use config::{PointsPolicy, TrackerConfig};
pub use error::{Result, TrackerError};
pub use session::{Accrual, CompletedSession, SessionStatus, SessionTally};
pub use settlement::{InMemoryLedger, Settlement, SettlementError};
pub use tracker::{Insights, SessionTracker, StartedSession};
