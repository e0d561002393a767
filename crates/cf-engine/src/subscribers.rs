//! Subscriber registry
//!
//! Observers register either a callback or a channel and get back a
//! [`SubscriptionId`]. Unsubscribing is explicit and takes effect before
//! [`SubscriberRegistry::unsubscribe`] returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Subscriber<E> {
    Callback(Callback<E>),
    Channel(mpsc::UnboundedSender<E>),
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Callback(callback) => Self::Callback(Arc::clone(callback)),
            Self::Channel(sender) => Self::Channel(sender.clone()),
        }
    }
}

struct Inner<E> {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Subscriber<E>)>,
}

pub struct SubscriberRegistry<E> {
    inner: Mutex<Inner<E>>,
}

impl<E> Default for SubscriberRegistry<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }
}

impl<E: Clone> SubscriberRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` for every event. Callbacks run on the emitting thread.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(Subscriber::Callback(Arc::new(callback)))
    }

    /// Receive events through a channel.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.insert(Subscriber::Channel(tx)), rx)
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(existing, _)| *existing != id);
        inner.subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every subscriber. Channels whose receiver is gone
    /// are dropped.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<(SubscriptionId, Subscriber<E>)> = self.lock().subscribers.clone();

        let mut closed = Vec::new();
        for (id, subscriber) in snapshot {
            match subscriber {
                Subscriber::Callback(callback) => callback(event),
                Subscriber::Channel(sender) => {
                    if sender.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.lock().subscribers.retain(|(id, _)| !closed.contains(id));
        }
    }

    fn insert(&self, subscriber: Subscriber<E>) -> SubscriptionId {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, subscriber));
        id
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_receive_events_until_unsubscribed() {
        let registry = SubscriberRegistry::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let id = registry.subscribe(move |value| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        });

        registry.emit(&2);
        registry.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&10);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn channels_receive_clones() {
        let registry = SubscriberRegistry::<String>::new();
        let (_, mut first) = registry.subscribe_channel();
        let (_, mut second) = registry.subscribe_channel();

        registry.emit(&"rebuilt".to_string());

        assert_eq!(first.try_recv().unwrap(), "rebuilt");
        assert_eq!(second.try_recv().unwrap(), "rebuilt");
    }

    #[test]
    fn closed_channels_are_pruned() {
        let registry = SubscriberRegistry::<u8>::new();
        let (_, rx) = registry.subscribe_channel();
        registry.subscribe(|_| {});
        drop(rx);

        registry.emit(&1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn callbacks_may_unsubscribe_during_emit() {
        let registry = Arc::new(SubscriberRegistry::<u8>::new());
        let handle = Arc::clone(&registry);
        let id = Arc::new(Mutex::new(None));
        let own_id = Arc::clone(&id);

        let subscribed = registry.subscribe(move |_| {
            if let Some(id) = own_id.lock().unwrap().take() {
                handle.unsubscribe(id);
            }
        });
        *id.lock().unwrap() = Some(subscribed);

        registry.emit(&1);
        assert!(registry.is_empty());
    }
}
