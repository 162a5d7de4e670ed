//! # Zero-Copy Message Dispatcher
//!
//! Fans published items out to every subscriber. Each item is wrapped in an
//! `Arc` once and every subscriber receives a pointer to the same allocation,
//! so publishing costs one refcount bump per subscriber regardless of payload
//! size.
//!
//! Subscribers own the receiving half of an unbounded channel. Delivery never
//! blocks the publisher; a subscriber that dropped its receiver is pruned on the
//! next broadcast.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

/// A registered subscriber.
struct SubscriberHandle<T> {
    /// Name used in logs.
    id: String,
    sender: mpsc::UnboundedSender<Arc<T>>,
    /// Items delivered so far.
    delivered: Arc<AtomicUsize>,
}

/// # Dispatcher
pub struct Dispatcher<T> {
    subscribers: Mutex<Vec<SubscriberHandle<T>>>,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T> {
    /// Creates a dispatcher with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// # Subscribe
    ///
    /// Registers `id` and returns the receiver that will observe every item
    /// broadcast from now on, in broadcast order.
    pub fn subscribe(&self, id: &str) -> mpsc::UnboundedReceiver<Arc<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(SubscriberHandle {
            id: id.to_string(),
            sender: tx,
            delivered: Arc::new(AtomicUsize::new(0)),
        });
        log::info!("Subscriber '{}' registered", id);
        rx
    }

    /// # Broadcast
    ///
    /// Sends an `Arc` clone of `item` to every live subscriber and removes
    /// those whose receiver is gone. Returns the number of deliveries.
    pub fn broadcast(&self, item: Arc<T>) -> usize {
        let mut subscribers = self.lock();
        let mut delivered = 0;
        subscribers.retain(|sub| match sub.sender.send(Arc::clone(&item)) {
            Ok(()) => {
                sub.delivered.fetch_add(1, Ordering::Relaxed);
                delivered += 1;
                true
            }
            Err(_) => {
                log::info!(
                    "Subscriber '{}' went away after {} items. Removing.",
                    sub.id,
                    sub.delivered.load(Ordering::Relaxed)
                );
                false
            }
        });
        delivered
    }

    /// Removes a subscriber by name.
    pub fn unsubscribe(&self, id: &str) {
        self.lock().retain(|sub| sub.id != id);
        log::info!("Subscriber '{}' explicitly removed.", id);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SubscriberHandle<T>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_the_same_allocation() {
        let dispatcher: Dispatcher<String> = Dispatcher::new();
        let mut a = dispatcher.subscribe("a");
        let mut b = dispatcher.subscribe("b");

        let item = Arc::new("payload".to_string());
        assert_eq!(dispatcher.broadcast(Arc::clone(&item)), 2);

        let got_a = a.try_recv().unwrap();
        let got_b = b.try_recv().unwrap();
        assert!(Arc::ptr_eq(&got_a, &item));
        assert!(Arc::ptr_eq(&got_b, &item));
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let dispatcher: Dispatcher<u32> = Dispatcher::new();
        let keep = dispatcher.subscribe("keep");
        let gone = dispatcher.subscribe("gone");
        drop(gone);

        assert_eq!(dispatcher.broadcast(Arc::new(1)), 1);
        assert_eq!(dispatcher.subscriber_count(), 1);

        dispatcher.unsubscribe("keep");
        assert_eq!(dispatcher.subscriber_count(), 0);
        drop(keep);
    }
}
