//! Periodic tick tasks
//!
//! A `Ticker` spawns a tokio task that calls a closure once per period. The
//! first tick fires one full period after spawning. Dropping or cancelling
//! the returned `TickHandle` aborts the task.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Fixed-cadence tick source
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    period: Duration,
}

impl Ticker {
    pub fn every(period: Duration) -> Self {
        Self { period }
    }

    /// Spawn a task on the current runtime calling `on_tick` every period.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, mut on_tick: F) -> TickHandle
    where
        F: FnMut() + Send + 'static,
    {
        let period = self.period;
        let first = Instant::now() + period;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                interval.tick().await;
                on_tick();
            }
        });
        TickHandle { task: Some(task) }
    }
}

/// Ownership of a running tick task
#[derive(Debug)]
pub struct TickHandle {
    task: Option<JoinHandle<()>>,
}

impl TickHandle {
    /// Stop the task. Returns `false` if it was already cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
