//! Per-class request and token budget tracking.
//!
//! [`BudgetTracker`] is plain state with no locking; [`SharedBudget`] wraps it
//! in a mutex so that refill, admission, reconciliation and depletion are
//! mutually exclusive for every holder of the same handle.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

/// Length of one budget window in nanoseconds.
const WINDOW_NANOS: u128 = 60_000_000_000;
/// Length of one budget window in milliseconds.
const WINDOW_MILLIS: f64 = 60_000.0;

/// Units restored by a single refill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Refill {
    pub requests: u64,
    pub tokens: u64,
}

impl Refill {
    pub fn is_empty(&self) -> bool {
        self.requests == 0 && self.tokens == 0
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Budget was reserved for the call.
    Admitted,
    /// Not enough budget; try again after the suggested delay.
    Wait(Duration),
}

/// Point-in-time view of a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub request_capacity: u64,
    pub token_capacity: u64,
    pub available_requests: u64,
    /// Negative while an under-estimated call is being paid off.
    pub available_tokens: i64,
}

/// Two time-refilled budgets (requests and tokens) for one resource class.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    request_capacity: u64,
    token_capacity: u64,
    available_requests: u64,
    available_tokens: i64,
    last_refill: Instant,
    /// Sub-unit refill progress, in (nanoseconds × capacity).
    request_carry: u128,
    token_carry: u128,
}

impl BudgetTracker {
    /// Create a full budget whose refill clock starts now.
    pub fn new(request_capacity: u64, token_capacity: u64) -> Self {
        Self::starting_at(request_capacity, token_capacity, Instant::now())
    }

    /// Create a full budget whose refill clock starts at `start`.
    pub fn starting_at(request_capacity: u64, token_capacity: u64, start: Instant) -> Self {
        Self {
            request_capacity,
            token_capacity,
            available_requests: request_capacity,
            available_tokens: to_signed(token_capacity),
            last_refill: start,
            request_carry: 0,
            token_carry: 0,
        }
    }

    pub fn request_capacity(&self) -> u64 {
        self.request_capacity
    }

    pub fn token_capacity(&self) -> u64 {
        self.token_capacity
    }

    pub fn available_requests(&self) -> u64 {
        self.available_requests
    }

    pub fn available_tokens(&self) -> i64 {
        self.available_tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Restore budget proportionally to the time elapsed since the last refill.
    ///
    /// Nothing changes until at least one whole unit of either budget has
    /// accrued, so calling this repeatedly with the same `now` is harmless.
    /// Fractional progress toward the next unit is kept rather than dropped.
    pub fn refill(&mut self, now: Instant) -> Refill {
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();

        let request_accrued = self.request_carry + elapsed * u128::from(self.request_capacity);
        let token_accrued = self.token_carry + elapsed * u128::from(self.token_capacity);
        let request_units = request_accrued / WINDOW_NANOS;
        let token_units = token_accrued / WINDOW_NANOS;

        if request_units == 0 && token_units == 0 {
            return Refill::default();
        }

        let requests_before = self.available_requests;
        let tokens_before = self.available_tokens;

        self.available_requests = self
            .available_requests
            .saturating_add(clamp_u64(request_units))
            .min(self.request_capacity);
        self.request_carry = if self.available_requests == self.request_capacity {
            0
        } else {
            request_accrued % WINDOW_NANOS
        };

        let token_capacity = to_signed(self.token_capacity);
        self.available_tokens = self
            .available_tokens
            .saturating_add(to_signed(clamp_u64(token_units)))
            .min(token_capacity);
        self.token_carry = if self.available_tokens == token_capacity {
            0
        } else {
            token_accrued % WINDOW_NANOS
        };

        self.last_refill = now;

        Refill {
            requests: self.available_requests - requests_before,
            tokens: (self.available_tokens - tokens_before).unsigned_abs(),
        }
    }

    /// Reserve one request and `tokens_needed` tokens if both are available.
    ///
    /// Leaves the budget untouched when either is short.
    pub fn try_admit(&mut self, tokens_needed: u64) -> bool {
        let needed = to_signed(tokens_needed);
        if self.available_requests >= 1 && self.available_tokens >= needed {
            self.available_requests -= 1;
            self.available_tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Correct the token budget once the actual output size is known.
    ///
    /// With an explicit cap the unused part of the reserved allowance is
    /// credited back. Without one nothing was reserved for output, so the
    /// actual output is debited and the balance may go negative.
    /// Returns the signed adjustment applied.
    pub fn reconcile(&mut self, estimated_tokens: u64, actual_tokens: u64, had_explicit_cap: bool) -> i64 {
        let before = self.available_tokens;
        if had_explicit_cap {
            if estimated_tokens > actual_tokens {
                let refund = to_signed(estimated_tokens - actual_tokens);
                self.available_tokens = self
                    .available_tokens
                    .saturating_add(refund)
                    .min(to_signed(self.token_capacity));
            }
        } else {
            self.available_tokens = self.available_tokens.saturating_sub(to_signed(actual_tokens));
        }
        self.available_tokens - before
    }

    /// Empty the token budget so the next admission waits for a refill.
    pub fn force_deplete_tokens(&mut self) {
        self.available_tokens = 0;
        self.token_carry = 0;
    }

    /// How long to wait before retrying admission for `tokens_needed`.
    ///
    /// The larger of the time to refill the token shortfall and the time to
    /// refill one request.
    pub fn wait_hint(&self, tokens_needed: u64) -> Duration {
        let shortfall = (to_signed(tokens_needed) - self.available_tokens).max(0) as f64;
        let token_wait = shortfall / self.token_capacity.max(1) as f64 * WINDOW_MILLIS;
        let request_wait = WINDOW_MILLIS / self.request_capacity.max(1) as f64;
        Duration::from_millis(token_wait.max(request_wait).ceil() as u64)
    }

    /// Refill, then admit or report how long to wait.
    pub fn admit(&mut self, tokens_needed: u64, now: Instant) -> Admission {
        let refilled = self.refill(now);
        if !refilled.is_empty() {
            trace!(
                requests = refilled.requests,
                tokens = refilled.tokens,
                "budget refilled"
            );
        }
        if self.try_admit(tokens_needed) {
            Admission::Admitted
        } else {
            Admission::Wait(self.wait_hint(tokens_needed))
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            request_capacity: self.request_capacity,
            token_capacity: self.token_capacity,
            available_requests: self.available_requests,
            available_tokens: self.available_tokens,
        }
    }
}

/// Thread-safe budget handle shared by everything admitting into one class.
#[derive(Debug, Clone)]
pub struct SharedBudget {
    inner: Arc<Mutex<BudgetTracker>>,
}

impl SharedBudget {
    /// Create a full shared budget.
    pub fn new(request_capacity: u64, token_capacity: u64) -> Self {
        Self::from_tracker(BudgetTracker::new(request_capacity, token_capacity))
    }

    pub fn from_tracker(tracker: BudgetTracker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(tracker)),
        }
    }

    // Every mutation completes before the guard drops, so a poisoned lock
    // still holds a consistent budget.
    fn lock(&self) -> MutexGuard<'_, BudgetTracker> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refill and admit in one critical section.
    pub fn admit(&self, tokens_needed: u64) -> Admission {
        self.lock().admit(tokens_needed, Instant::now())
    }

    pub fn refill(&self, now: Instant) -> Refill {
        self.lock().refill(now)
    }

    pub fn try_admit(&self, tokens_needed: u64) -> bool {
        self.lock().try_admit(tokens_needed)
    }

    pub fn reconcile(&self, estimated_tokens: u64, actual_tokens: u64, had_explicit_cap: bool) -> i64 {
        self.lock()
            .reconcile(estimated_tokens, actual_tokens, had_explicit_cap)
    }

    pub fn force_deplete_tokens(&self) {
        self.lock().force_deplete_tokens();
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        self.lock().snapshot()
    }
}

fn to_signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn clamp_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
