//! Fan-out of status snapshots to live dashboard subscribers
//!
//! Each subscriber gets its own bounded channel. Publishing never waits: a
//! full channel drops the message for that subscriber only, and a closed
//! channel removes the subscriber.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Default per-subscriber queue depth
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 16;

pub struct StatusBroadcaster {
    subscribers: DashMap<u64, mpsc::Sender<Arc<String>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscriber; dropping the receiver unsubscribes on the next publish
    pub fn subscribe(&self) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        debug!(subscriber = id, total = self.subscribers.len(), "Status subscriber added");
        rx
    }

    /// Deliver `message` to every subscriber without blocking
    pub fn publish(&self, message: impl Into<String>) {
        let message = Arc::new(message.into());
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&message)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = *entry.key(), "Subscriber is slow, dropping update");
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // Removing while iterating would deadlock the shard
        for id in closed {
            self.subscribers.remove(&id);
            debug!(subscriber = id, "Status subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let broadcaster = StatusBroadcaster::new(4);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.publish("hello");

        assert_eq!(a.recv().await.unwrap().as_str(), "hello");
        assert_eq!(b.recv().await.unwrap().as_str(), "hello");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking_others() {
        let broadcaster = StatusBroadcaster::new(2);
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        for i in 0..5 {
            broadcaster.publish(format!("msg {}", i));
            assert_eq!(fast.recv().await.unwrap().as_str(), format!("msg {}", i));
        }

        // Only the first two fit; the rest were dropped for this subscriber
        assert_eq!(slow.recv().await.unwrap().as_str(), "msg 0");
        assert_eq!(slow.recv().await.unwrap().as_str(), "msg 1");
        assert!(slow.try_recv().is_err());
        assert_eq!(broadcaster.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let broadcaster = StatusBroadcaster::default();
        let keep = broadcaster.subscribe();
        let gone = broadcaster.subscribe();
        drop(gone);

        broadcaster.publish("tick");

        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(keep);
        broadcaster.publish("tock");
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
