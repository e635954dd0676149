//! In-Process Event Bus
//!
//! Pattern-based publish/subscribe used to feed the pipeline when the
//! bridge runs inside the same process as its publishers, and by tests.
//!
//! Handlers for one publish are awaited sequentially in registration order.
//! The handler list is cloned out of the lock before any handler runs, so a
//! handler may publish or (un)subscribe without deadlocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::application::ports::{EventBusPort, EventHandler, HandlerId};
use crate::domain::streaming::{Event, TopicPattern};

struct Registration {
    id: HandlerId,
    pattern: TopicPattern,
    handler: Arc<dyn EventHandler>,
}

/// Bus statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    /// Registered handlers.
    pub handlers: usize,
    /// Publish calls.
    pub published: u64,
    /// Handler invocations.
    pub delivered: u64,
    /// Publishes that reached no handler.
    pub unrouted: u64,
}

/// In-memory implementation of [`EventBusPort`].
#[derive(Default)]
pub struct InMemoryEventBus {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    unrouted: AtomicU64,
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.registrations.read().len()
    }

    /// Bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            handlers: self.handler_count(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
        }
    }

    fn matching(&self, topic: &str) -> Vec<Arc<dyn EventHandler>> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.pattern.matches(topic))
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventBusPort for InMemoryEventBus {
    fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.write().push(Registration {
            id,
            pattern: TopicPattern::new(pattern),
            handler,
        });
        tracing::debug!(pattern, handler = %id, "Bus handler registered");
        id
    }

    fn unsubscribe(&self, pattern: &str, id: HandlerId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| !(r.id == id && r.pattern.as_str() == pattern));
        let removed = registrations.len() < before;
        drop(registrations);

        if removed {
            tracing::debug!(pattern, handler = %id, "Bus handler removed");
        }
        removed
    }

    async fn publish(&self, topic: &str, payload: Value) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let handlers = self.matching(topic);
        if handlers.is_empty() {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(topic, "No bus handler for topic");
            return 0;
        }

        let event = Event::now(topic, payload);
        for handler in &handlers {
            handler.handle(event.clone()).await;
        }
        self.delivered
            .fetch_add(handlers.len() as u64, Ordering::Relaxed);
        handlers.len()
    }
}
