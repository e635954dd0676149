//! Event Bus Port (Driver Port)
//!
//! Topic-based publish/subscribe feeding events into the pipeline.
//! Delivery is at-most-once with no ordering across topics.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::streaming::Event;

/// Identifier returned by [`EventBusPort::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Receives events from the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Must not fail; errors are logged by the handler.
    async fn handle(&self, event: Event);
}

/// Adapter turning an async closure into an [`EventHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: Event) {
        (self.0)(event).await;
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Port for the internal publish/subscribe bus.
#[async_trait]
pub trait EventBusPort: Send + Sync {
    /// Register a handler for a topic pattern (`*` one segment, trailing
    /// `**` any number of segments).
    fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> HandlerId;

    /// Remove a handler. Returns `false` if it was not registered.
    fn unsubscribe(&self, pattern: &str, id: HandlerId) -> bool;

    /// Publish a payload. Returns the number of handlers it reached.
    async fn publish(&self, topic: &str, payload: Value) -> usize;
}
