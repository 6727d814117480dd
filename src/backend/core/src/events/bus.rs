//! Topic-based publish/subscribe.
//!
//! Handlers are stored as `Arc<dyn Fn(&T)>` so a publish can snapshot them
//! under the lock and call them after releasing it. Consequences:
//!   - a handler removed during a publish is still called in that round;
//!   - a handler added during a publish is first called on the next one.
//!
//! Handlers may therefore subscribe/unsubscribe from inside a callback
//! without deadlocking. Delivery is synchronous and only reaches handlers
//! subscribed at publish time (no replay).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// Returned by [`EventBus::subscribe`]; pass it back to unsubscribe.
pub type ListenerId = u64;

/// Handler closure type.
pub type HandlerFn<T> = dyn Fn(&T) + Send + Sync;

/// Named-topic event bus.
pub struct EventBus<T> {
    topics: Mutex<HashMap<String, Vec<(ListenerId, Arc<HandlerFn<T>>)>>>,
    next_id: AtomicU64,
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` on `topic`.
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        trace!(topic = %topic, listener_id = id, "Listener subscribed");
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, topic: &str, id: ListenerId) -> bool {
        let mut topics = self.topics.lock();
        let Some(handlers) = topics.get_mut(topic) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|(lid, _)| *lid != id);
        let removed = handlers.len() != before;

        if handlers.is_empty() {
            topics.remove(topic);
        }
        if removed {
            trace!(topic = %topic, listener_id = id, "Listener unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every handler currently on `topic`.
    ///
    /// Returns the number of handlers called.
    pub fn publish(&self, topic: &str, event: &T) -> usize {
        let snapshot: Vec<Arc<HandlerFn<T>>> = {
            let topics = self.topics.lock();
            match topics.get(topic) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return 0,
            }
        };

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    /// Number of handlers on `topic`.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Number of topics with at least one handler.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
