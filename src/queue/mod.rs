//! Per-class admission queue.
//!
//! A [`ResourceQueue`] owns the budget of one resource class. Every submitted
//! call moves through the same states:
//!
//! ```text
//! Estimating -> AwaitingAdmission -> Executing -> Reconciling -> Succeeded
//!                      ^                  |
//!                      |                  v
//!                      +------------- Retrying -> Failed
//! ```
//!
//! Waiting for budget is backpressure, never an error. After a failure the
//! token budget is emptied and the call backs off before going through
//! admission again, so a failing class cannot hammer the service.

mod retry;
mod transport;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn, Instrument};

use crate::budget::{Admission, BudgetSnapshot, CostEstimate, CostEstimator, SharedBudget};
use crate::call::{CallResult, PendingCall};
use crate::config::ResourceClassConfig;
use crate::error::{ConfigResult, DispatchError, DispatchResult, TransportError};

pub use retry::{RetryDecision, RetryState};
pub use transport::{transport_fn, Transport, TransportFn};

/// Lifecycle of a submitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Estimating,
    AwaitingAdmission,
    Executing,
    Reconciling,
    Retrying,
    Succeeded,
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Estimating => "estimating",
            CallState::AwaitingAdmission => "awaiting_admission",
            CallState::Executing => "executing",
            CallState::Reconciling => "reconciling",
            CallState::Retrying => "retrying",
            CallState::Succeeded => "succeeded",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a queue's activity and budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub resource_class: String,
    /// Calls waiting for admission
    pub waiting: usize,
    /// Calls admitted and not yet reconciled
    pub in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub budget: BudgetSnapshot,
}

#[derive(Debug, Default)]
struct QueueCounters {
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Decrements a gauge when dropped, including when the owning future is dropped.
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Admission, execution and retry for one resource class.
pub struct ResourceQueue {
    name: String,
    config: ResourceClassConfig,
    budget: SharedBudget,
    estimator: CostEstimator,
    transport: Arc<dyn Transport>,
    counters: Arc<QueueCounters>,
}

impl fmt::Debug for ResourceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceQueue")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("budget", &self.budget.snapshot())
            .finish_non_exhaustive()
    }
}

impl ResourceQueue {
    /// Create a queue with a full budget and the default estimator.
    pub fn new(
        name: impl Into<String>,
        config: ResourceClassConfig,
        transport: Arc<dyn Transport>,
    ) -> ConfigResult<Self> {
        let name = name.into();
        config.validate(&name)?;
        Ok(Self {
            budget: SharedBudget::new(config.request_capacity, config.token_capacity),
            name,
            config,
            estimator: CostEstimator::default(),
            transport,
            counters: Arc::new(QueueCounters::default()),
        })
    }

    /// Replace the cost estimator.
    pub fn with_estimator(mut self, estimator: CostEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ResourceClassConfig {
        &self.config
    }

    /// The budget handle shared by every call in this class.
    pub fn budget(&self) -> &SharedBudget {
        &self.budget
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            resource_class: self.name.clone(),
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            succeeded: self.counters.succeeded.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            budget: self.budget.snapshot(),
        }
    }

    /// Estimate, wait for budget, execute and reconcile, retrying on failure.
    ///
    /// Dropping the returned future while it waits for admission or backs off
    /// has no effect on the budget. Once an attempt is admitted it runs to
    /// completion and settles the budget even if the caller is gone.
    pub async fn submit(&self, call: PendingCall) -> DispatchResult<CallResult> {
        debug!(resource_class = %self.name, state = %CallState::Estimating, "call submitted");
        let estimate = match self.estimator.estimate(&call) {
            Ok(estimate) => estimate,
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(resource_class = %self.name, error = %error, "cannot estimate call");
                return Err(error.into());
            }
        };

        if estimate.total > self.config.token_capacity {
            if self.config.reject_oversized {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(DispatchError::CostExceedsCapacity {
                    resource_class: self.name.clone(),
                    estimated: estimate.total,
                    capacity: self.config.token_capacity,
                });
            }
            warn!(
                resource_class = %self.name,
                estimated = estimate.total,
                capacity = self.config.token_capacity,
                "call exceeds token capacity and will never be admitted"
            );
        }

        let call = Arc::new(call);
        let mut retry = RetryState::new(self.config.max_attempts, self.config.backoff());

        loop {
            self.await_admission(estimate.total).await;

            let error = match self.execute_admitted(Arc::clone(&call), estimate).await {
                Ok(result) => {
                    self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        resource_class = %self.name,
                        state = %CallState::Succeeded,
                        attempt = retry.attempts() + 1,
                        tokens = result.actual_tokens_consumed(),
                        "call completed"
                    );
                    return Ok(result);
                }
                Err(error) => error,
            };

            warn!(
                resource_class = %self.name,
                attempt = retry.attempts() + 1,
                error = %error,
                "call failed"
            );

            match retry.record_failure(error) {
                RetryDecision::Backoff(delay) => {
                    warn!(
                        resource_class = %self.name,
                        state = %CallState::Retrying,
                        backoff_ms = delay.as_millis() as u64,
                        "backing off before retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted(last_error) => {
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    error!(
                        resource_class = %self.name,
                        state = %CallState::Failed,
                        attempts = retry.attempts(),
                        error = %last_error,
                        "retries exhausted"
                    );
                    return Err(DispatchError::Exhausted {
                        resource_class: self.name.clone(),
                        attempts: retry.attempts(),
                        last_error,
                    });
                }
            }
        }
    }

    /// Suspend until `tokens` and one request have been reserved.
    async fn await_admission(&self, tokens: u64) {
        let _waiting = GaugeGuard::enter(&self.counters.waiting);
        loop {
            match self.budget.admit(tokens) {
                Admission::Admitted => return,
                Admission::Wait(delay) => {
                    debug!(
                        resource_class = %self.name,
                        state = %CallState::AwaitingAdmission,
                        tokens,
                        wait_ms = delay.as_millis() as u64,
                        "waiting for budget"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run one admitted attempt on its own task so the budget is always settled.
    async fn execute_admitted(
        &self,
        call: Arc<PendingCall>,
        estimate: CostEstimate,
    ) -> Result<CallResult, TransportError> {
        let budget = self.budget.clone();
        let transport = Arc::clone(&self.transport);
        let counters = Arc::clone(&self.counters);
        counters.in_flight.fetch_add(1, Ordering::SeqCst);

        let span = tracing::debug_span!("attempt", resource_class = %self.name);
        let handle = tokio::spawn(
            async move {
                debug!(state = %CallState::Executing, estimated = estimate.total, "sending call");
                let outcome = transport.execute(&call).await;
                match &outcome {
                    Ok(result) => {
                        let adjustment = budget.reconcile(
                            estimate.output_allowance,
                            result.usage.completion_tokens,
                            call.has_output_cap(),
                        );
                        debug!(state = %CallState::Reconciling, adjustment, "budget reconciled");
                    }
                    Err(_) => budget.force_deplete_tokens(),
                }
                counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                outcome
            }
            .instrument(span),
        );

        match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                self.budget.force_deplete_tokens();
                self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                Err(TransportError::Aborted(join_error.to_string()))
            }
        }
    }
}
