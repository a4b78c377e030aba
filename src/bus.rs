//! Per-topic publish/subscribe glue.
//!
//! Sessions and clients subscribe to each other's topics, which would
//! form reference cycles if subscriptions were strong — so the bus holds
//! subscribers weakly and purges dead entries lazily at publish time.
//! Dispatch is synchronous on the publisher's calling thread and always
//! happens after the bus lock is released; subscribers must not re-enter
//! the publisher.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// A receiver of events on one topic.
pub trait Subscriber<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

/// A single-topic event bus with weakly-held subscribers.
pub struct EventBus<E> {
    subscribers: RwLock<Vec<Weak<dyn Subscriber<E>>>>,
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Add a subscriber. Re-subscribing the same object is a no-op.
    pub fn subscribe<S>(&self, subscriber: &Arc<S>)
    where
        S: Subscriber<E> + 'static,
    {
        let subscriber: Arc<dyn Subscriber<E>> = subscriber.clone();
        let weak: Weak<dyn Subscriber<E>> = Arc::downgrade(&subscriber);

        let mut subscribers = self.subscribers.write();
        if !subscribers.iter().any(|existing| existing.ptr_eq(&weak)) {
            subscribers.push(weak);
        }
    }

    /// Remove a subscriber, if present.
    pub fn unsubscribe<S>(&self, subscriber: &Arc<S>)
    where
        S: Subscriber<E> + 'static,
    {
        let subscriber: Arc<dyn Subscriber<E>> = subscriber.clone();
        let weak: Weak<dyn Subscriber<E>> = Arc::downgrade(&subscriber);

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|existing| !existing.ptr_eq(&weak));
    }

    /// Deliver `event` to every live subscriber. Expired weak handles
    /// observed here are dropped from the list.
    pub fn publish(&self, event: &E) {
        let live: Vec<Arc<dyn Subscriber<E>>> = {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };

        for subscriber in live {
            subscriber.on_event(event);
        }
    }

    /// Number of currently live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
