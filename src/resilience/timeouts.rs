//! Timeout enforcement.
//!
//! # Responsibilities
//! - Track the cumulative time budget of one request's retry chain
//! - Cap every per-attempt timeout by what is left of that budget
//!
//! # Design Decisions
//! - Uses Tokio's clock so paused-time tests are deterministic
//! - An exhausted budget ends the retry chain; it never blocks

use std::time::Duration;

use tokio::time::Instant;

/// Cumulative deadline shared by all attempts of a request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left, or `None` once the budget is spent.
    pub fn remaining(&self) -> Option<Duration> {
        self.budget
            .checked_sub(self.elapsed())
            .filter(|left| !left.is_zero())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// `per_attempt` capped by the remaining budget.
    pub fn cap(&self, per_attempt: Duration) -> Option<Duration> {
        self.remaining().map(|left| left.min(per_attempt))
    }
}
