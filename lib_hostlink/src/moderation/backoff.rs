//! # Backoff Schedule
//!
//! Fixed waits applied between rate-limited attempts. Entry `i` is the wait
//! before attempt `i`, so the first entry is normally zero and the schedule's
//! length is the attempt budget.

use std::time::Duration;

/// Ordered waits, one per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from_millis(&[0, 1000, 3000, 6000, 10000])
    }
}

impl BackoffSchedule {
    /// Builds a schedule. An empty list still allows one immediate attempt.
    pub fn new(delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            return Self {
                delays: vec![Duration::ZERO],
            };
        }
        Self { delays }
    }

    /// Builds a schedule from millisecond values.
    pub fn from_millis(millis: &[u64]) -> Self {
        Self::new(millis.iter().copied().map(Duration::from_millis).collect())
    }

    /// Attempt budget. At least one.
    pub fn attempts(&self) -> usize {
        self.delays.len()
    }

    /// Wait before attempt `attempt` (zero-based), or `None` past the budget.
    pub fn delay_before(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    /// All waits in order.
    pub fn iter(&self) -> impl Iterator<Item = Duration> + '_ {
        self.delays.iter().copied()
    }

    /// Sum of the waits before the first `attempts` attempts.
    pub fn total_before(&self, attempts: usize) -> Duration {
        self.delays.iter().take(attempts).sum()
    }
}
