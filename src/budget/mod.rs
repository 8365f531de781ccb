//! Request and token budgets for rate-limited resource classes.
//!
//! # Overview
//!
//! - **BudgetTracker**: two per-minute budgets (requests, tokens) refilled in
//!   proportion to elapsed time, with atomic admission through **SharedBudget**
//! - **CostEstimator**: reserves `(prompt + output cap) × outputs` tokens per call
//! - **TokenUsageParser**: reads the actual usage a service reports back
//!
//! # Example
//!
//! ```ignore
//! use modelqueue::budget::{Admission, SharedBudget};
//!
//! let budget = SharedBudget::new(200, 40_000);
//!
//! match budget.admit(1_500) {
//!     Admission::Admitted => { /* send the call */ }
//!     Admission::Wait(delay) => { /* sleep, then try again */ }
//! }
//!
//! // Capped at 500 output tokens, used 120: refund the difference.
//! budget.reconcile(500, 120, true);
//! ```

mod estimator;
mod tracker;
mod usage;

pub use estimator::{CostEstimate, CostEstimator, EstimationMethod, PromptCounter, TokenEstimator};
pub use tracker::{Admission, BudgetSnapshot, BudgetTracker, Refill, SharedBudget};
pub use usage::{TokenUsage, TokenUsageParser};
