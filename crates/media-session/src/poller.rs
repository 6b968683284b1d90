//! Position poller
//!
//! At most one poll is active at a time. The engine loop awaits
//! [`PositionPoller::next_tick`] next to its event channel, so a tick can only
//! fire between two events and never after [`PositionPoller::stop`] returns.

use mediabridge_core::SessionId;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Default cadence of position updates while playing
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct ActivePoll {
    session: SessionId,
    due: Instant,
}

#[derive(Debug)]
pub struct PositionPoller {
    period: Duration,
    active: Option<ActivePoll>,
}

impl Default for PositionPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl PositionPoller {
    pub fn new(period: Duration) -> Self {
        Self { period, active: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start polling `session`, cancelling any running poll. The first tick is due immediately.
    /// Returns true if a previous poll was replaced.
    pub fn start(&mut self, session: SessionId) -> bool {
        let replaced = self.stop();
        self.active = Some(ActivePoll {
            session,
            due: Instant::now(),
        });
        replaced
    }

    /// Idempotent; returns true if a poll was running
    pub fn stop(&mut self) -> bool {
        self.active.take().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Session being polled, if any
    pub fn session(&self) -> Option<&SessionId> {
        self.active.as_ref().map(|active| &active.session)
    }

    /// Wait for the next tick and schedule the one after it.
    ///
    /// Pending forever while idle. Cancel safe: dropping the future before it
    /// completes leaves the schedule untouched.
    pub async fn next_tick(&mut self) -> SessionId {
        let period = self.period;
        let Some(active) = self.active.as_mut() else {
            return std::future::pending().await;
        };

        sleep_until(active.due).await;
        active.due = Instant::now() + period;
        active.session.clone()
    }
}
