//! Rate-limited dispatch of completion calls.
//!
//! Each resource class (usually a model name) gets its own [`ResourceQueue`]
//! with two per-minute budgets: requests and tokens. A call reserves its
//! estimated token cost and one request before it is sent, waits while the
//! budget is short, and settles the difference once the service reports what
//! was actually used. Failed attempts empty the token budget and are retried
//! after a fixed backoff.
//!
//! ```ignore
//! use std::sync::Arc;
//! use modelqueue::{transport_fn, CallResult, Dispatcher, Message, PendingCall};
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.register_class("gpt-4", 200, 40_000, Arc::new(transport_fn(|call| async move {
//!     let response = send_to_service(&call).await?;
//!     CallResult::from_response(response)
//! })))?;
//!
//! let result = dispatcher
//!     .dispatch(PendingCall::new("gpt-4", vec![Message::user("hi")]).with_output_cap(64))
//!     .await?;
//! ```

pub mod budget;
pub mod cache;
pub mod call;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod queue;

pub use budget::{CostEstimator, SharedBudget, TokenEstimator, TokenUsage};
pub use cache::{CacheKey, MemoryCache, ResponseCache};
pub use call::{CallResult, Message, PendingCall, Role};
pub use config::{DispatcherConfig, ResourceClassConfig};
pub use dispatch::Dispatcher;
pub use error::{
    ConfigError, ConfigResult, DispatchError, DispatchResult, EstimationError, TransportError,
};
pub use queue::{transport_fn, QueueStatus, ResourceQueue, Transport};
