use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

struct Subscriber<T> {
    id: u64,
    sender: mpsc::UnboundedSender<T>,
}

/// Named-event hub. Every subscriber receives each payload published under its
/// event name after it subscribed, in publish order.
pub struct EventBus<T> {
    topics: RwLock<HashMap<String, Vec<Subscriber<T>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.topics.read().get(event).map(Vec::len).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops every subscriber. Receivers drain what was already delivered and
    /// then observe end of stream.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.write().clear();
    }

    /// Accepts subscriptions and publishes again after [`EventBus::close`].
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn remove(&self, event: &str, id: u64) {
        let mut guard = self.topics.write();
        if let Some(subscribers) = guard.get_mut(event) {
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.is_empty() {
                guard.remove(event);
            }
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn subscribe(self: &Arc<Self>, event: &str) -> Subscription<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if !self.is_closed() {
            self.topics
                .write()
                .entry(event.to_string())
                .or_default()
                .push(Subscriber { id, sender });
        }
        Subscription {
            id,
            event: event.to_string(),
            receiver,
            bus: Arc::downgrade(self),
        }
    }

    /// Returns how many subscribers the payload was handed to.
    pub fn publish(&self, event: &str, payload: T) -> BusResult<usize> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let guard = self.topics.read();
        let Some(subscribers) = guard.get(event) else {
            return Ok(0);
        };
        let delivered = subscribers
            .iter()
            .filter(|subscriber| subscriber.sender.send(payload.clone()).is_ok())
            .count();
        Ok(delivered)
    }
}

/// Handle for one registration on an [`EventBus`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    event: String,
    receiver: mpsc::UnboundedReceiver<T>,
    bus: Weak<EventBus<T>>,
}

impl<T> Subscription<T> {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next payload, or `None` once the subscription was removed by a bus close.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.event, self.id);
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_only_matching_events() {
        let bus = EventBus::new();
        let mut ready = bus.subscribe("producer-ready");
        let mut closed = bus.subscribe("producer-closed");

        assert_eq!(bus.publish("producer-ready", "p1".to_string()), Ok(1));
        assert_eq!(ready.recv().await.as_deref(), Some("p1"));
        assert!(closed.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let bus: Arc<EventBus<u32>> = EventBus::new();
        let first = bus.subscribe("tick");
        let mut second = bus.subscribe("tick");
        assert_eq!(bus.subscriber_count("tick"), 2);

        first.unsubscribe();
        assert_eq!(bus.subscriber_count("tick"), 1);
        assert_eq!(bus.publish("tick", 7), Ok(1));
        assert_eq!(second.recv().await, Some(7));

        drop(second);
        assert_eq!(bus.subscriber_count("tick"), 0);
        assert_eq!(bus.publish("tick", 8), Ok(0));
    }

    #[tokio::test]
    async fn close_ends_streams_and_rejects_publish() {
        let bus: Arc<EventBus<u32>> = EventBus::new();
        let mut sub = bus.subscribe("tick");
        bus.publish("tick", 1).expect("publish before close");
        bus.close();

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.publish("tick", 2), Err(BusError::Closed));

        let mut late = bus.subscribe("tick");
        assert_eq!(late.recv().await, None);

        bus.reopen();
        let mut fresh = bus.subscribe("tick");
        assert_eq!(bus.publish("tick", 3), Ok(1));
        assert_eq!(fresh.recv().await, Some(3));
    }
}
