//! Routing of calls to per-class queues.
//!
//! The [`Dispatcher`] owns one [`ResourceQueue`] per registered resource
//! class and forwards each call by name. It holds no budget or retry logic of
//! its own. An optional [`ResponseCache`] sits in front of the queues: a hit
//! is answered without touching any budget.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = Dispatcher::new();
//! dispatcher.register_class("gpt-4", 200, 40_000, transport)?;
//!
//! let call = PendingCall::new("gpt-4", vec![Message::user("hello")]).with_output_cap(256);
//! let result = dispatcher.dispatch(call).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tracing::{debug, info};

use crate::budget::CostEstimator;
use crate::cache::{CacheKey, ResponseCache};
use crate::call::{CallResult, PendingCall};
use crate::config::{DispatcherConfig, ResourceClassConfig};
use crate::error::{DispatchError, DispatchResult};
use crate::queue::{QueueStatus, ResourceQueue, Transport};

struct Inner {
    queues: RwLock<HashMap<String, Arc<ResourceQueue>>>,
    cache: Option<Arc<dyn ResponseCache>>,
}

/// Routes calls to the queue of their resource class.
///
/// Clones share the same set of queues.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("classes", &self.classes())
            .field("cached", &self.inner.cache.is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher with no classes and no cache.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: RwLock::new(HashMap::new()),
                cache: None,
            }),
        }
    }

    /// Create a dispatcher that consults `cache` before queueing calls.
    pub fn with_cache(cache: Arc<dyn ResponseCache>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: RwLock::new(HashMap::new()),
                cache: Some(cache),
            }),
        }
    }

    /// Register one queue per class in `config`, building transports with `factory`.
    pub fn from_config<F>(config: DispatcherConfig, mut factory: F) -> DispatchResult<Self>
    where
        F: FnMut(&str) -> Arc<dyn Transport>,
    {
        let dispatcher = Self::new();
        for (name, class) in config.classes {
            let transport = factory(&name);
            dispatcher.register_with_config(name, class, transport)?;
        }
        Ok(dispatcher)
    }

    /// Register a class with default retry policy.
    ///
    /// Registering an existing name replaces its queue and budget. Calls
    /// already submitted to the old queue finish there.
    pub fn register_class(
        &self,
        name: impl Into<String>,
        request_capacity: u64,
        token_capacity: u64,
        transport: Arc<dyn Transport>,
    ) -> DispatchResult<()> {
        self.register_with_config(
            name,
            ResourceClassConfig::new(request_capacity, token_capacity),
            transport,
        )
    }

    /// Register a class with explicit limits and retry policy.
    pub fn register_with_config(
        &self,
        name: impl Into<String>,
        config: ResourceClassConfig,
        transport: Arc<dyn Transport>,
    ) -> DispatchResult<()> {
        let queue = ResourceQueue::new(name, config, transport)?;
        self.install(queue);
        Ok(())
    }

    /// Register a class with a custom cost estimator.
    pub fn register_with_estimator(
        &self,
        name: impl Into<String>,
        config: ResourceClassConfig,
        transport: Arc<dyn Transport>,
        estimator: CostEstimator,
    ) -> DispatchResult<()> {
        let queue = ResourceQueue::new(name, config, transport)?.with_estimator(estimator);
        self.install(queue);
        Ok(())
    }

    fn install(&self, queue: ResourceQueue) {
        let name = queue.name().to_string();
        info!(
            resource_class = %name,
            request_capacity = queue.config().request_capacity,
            token_capacity = queue.config().token_capacity,
            max_attempts = queue.config().max_attempts,
            "registered resource class"
        );
        let mut queues = self
            .inner
            .queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if queues.insert(name.clone(), Arc::new(queue)).is_some() {
            info!(resource_class = %name, "replaced existing queue");
        }
    }

    /// Remove a class. Calls already submitted to it finish normally.
    pub fn remove(&self, name: &str) -> bool {
        self.inner
            .queues
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
            .is_some()
    }

    /// The queue registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<ResourceQueue>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Status of every queue, sorted by class name.
    pub fn status(&self) -> Vec<QueueStatus> {
        let queues: Vec<Arc<ResourceQueue>> = self
            .inner
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut statuses: Vec<QueueStatus> = queues.iter().map(|q| q.status()).collect();
        statuses.sort_by(|a, b| a.resource_class.cmp(&b.resource_class));
        statuses
    }

    /// Route a call to the queue of its resource class.
    ///
    /// Fails immediately with [`DispatchError::UnknownResourceClass`] when no
    /// queue is registered under the call's class.
    pub async fn dispatch(&self, call: PendingCall) -> DispatchResult<CallResult> {
        let queue = self
            .get(&call.resource_class)
            .ok_or_else(|| DispatchError::UnknownResourceClass {
                name: call.resource_class.clone(),
            })?;

        let Some(cache) = &self.inner.cache else {
            return queue.submit(call).await;
        };

        let key = CacheKey::for_call(&call);
        if let Some(hit) = cache.lookup(&key) {
            debug!(resource_class = %call.resource_class, key = %key, "cache hit");
            return Ok(hit);
        }

        let result = queue.submit(call).await?;
        cache.store(key, &result);
        Ok(result)
    }
}

impl tower::Service<PendingCall> for Dispatcher {
    type Response = CallResult;
    type Error = DispatchError;
    type Future = BoxFuture<'static, DispatchResult<CallResult>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Backpressure happens per class inside the queues.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: PendingCall) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { dispatcher.dispatch(call).await })
    }
}
