//! The boundary to the remote completion service.

use std::future::Future;

use async_trait::async_trait;

use crate::call::{CallResult, PendingCall};
use crate::error::TransportError;

/// Executes one attempt of a call against the remote service.
///
/// Implementations must not retry on their own; the queue owns retry policy.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, call: &PendingCall) -> Result<CallResult, TransportError>;
}

/// Adapter turning an async closure into a [`Transport`].
#[derive(Clone)]
pub struct TransportFn<F> {
    f: F,
}

/// Wrap an async closure as a transport.
pub fn transport_fn<F, Fut>(f: F) -> TransportFn<F>
where
    F: Fn(PendingCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallResult, TransportError>> + Send,
{
    TransportFn { f }
}

#[async_trait]
impl<F, Fut> Transport for TransportFn<F>
where
    F: Fn(PendingCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallResult, TransportError>> + Send,
{
    async fn execute(&self, call: &PendingCall) -> Result<CallResult, TransportError> {
        (self.f)(call.clone()).await
    }
}
