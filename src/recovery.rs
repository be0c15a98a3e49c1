//! Retry and reconnect policy.
//!
//! A failing exchange escalates in two tiers: first it is repeated on the same
//! link, then the link is torn down and reopened and the repeats start over.
//! Once both budgets are spent the session gives up.
//!
//! [`Escalation`] is the bookkeeping for one call. It is plain data so the
//! decision table can be tested without any I/O.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Budgets and timings for a session's recovery behavior.
///
/// # Example
///
/// ```rust
/// use daq_comm::recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     ..RetryPolicy::default()
/// };
/// assert_eq!(policy.total_attempts(), 10);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per link before reconnecting. Must be at least 1.
    pub max_attempts: u32,

    /// Reconnect cycles before giving up. 0 disables reconnecting.
    pub max_reconnects: u32,

    /// How often a waiting session re-checks whether the channel is free.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Pause between closing and reopening the link during a reconnect.
    #[serde(with = "humantime_serde")]
    pub reconnect_settle: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts per link, one reconnect, 50ms busy polling.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_reconnects: 1,
            poll_interval: Duration::from_millis(50),
            reconnect_settle: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backend calls made for one operation before it is declared lost.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_mul(self.max_reconnects.saturating_add(1))
    }

    /// Policy with no pauses, for tests and simulated instruments.
    pub fn immediate() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            reconnect_settle: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Repeat on the current link.
    Retry,
    /// Close and reopen the link, then repeat.
    Reconnect,
    /// Budgets exhausted.
    GiveUp,
}

/// Failure counters for the operation in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Escalation {
    /// Failed attempts since the last reconnect (or since the call began).
    pub repeat_count: u32,
    /// Reconnect cycles performed during this call.
    pub reconnect_count: u32,
}

impl Escalation {
    /// Record a failed attempt and decide the next step.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> NextStep {
        self.repeat_count += 1;
        if self.repeat_count < policy.max_attempts {
            NextStep::Retry
        } else if self.reconnect_count < policy.max_reconnects {
            self.repeat_count = 0;
            self.reconnect_count += 1;
            NextStep::Reconnect
        } else {
            NextStep::GiveUp
        }
    }

    /// Clear both counters after a success.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
