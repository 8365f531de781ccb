//! Bounded retry with a fixed backoff.

use std::time::Duration;

use crate::error::TransportError;

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then go back through admission.
    Backoff(Duration),
    /// No attempts left; carries the last failure.
    Exhausted(TransportError),
}

/// Attempt bookkeeping for one submitted call.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempts: u32,
    max_attempts: u32,
    backoff: Duration,
}

impl RetryState {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Record a failed attempt and decide whether another one is allowed.
    pub fn record_failure(&mut self, error: TransportError) -> RetryDecision {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            RetryDecision::Exhausted(error)
        } else {
            RetryDecision::Backoff(self.backoff)
        }
    }
}
