//! # bus
//!
//! why: watchers follow applied messages live without stalling apply
//! relations: published by the history transcoder; subscribed through the service's watch call
//! what: EventBus, Observer
//!
//! One bus per node, owned by whoever assembles the node and handed to the
//! history transcoder (publisher) and the service (subscribers). Each
//! observer gets its own bounded queue; a slow observer loses messages
//! rather than stalling the apply path.

use fleet_core::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub type ObserverId = u64;

pub struct EventBus {
    next: AtomicU64,
    observers: Mutex<HashMap<ObserverId, mpsc::Sender<Message>>>,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self { next: AtomicU64::new(1), observers: Mutex::new(HashMap::new()), buffer: buffer.max(1) })
    }

    /// register a new observer; it is removed again when dropped
    pub fn register(self: &Arc<Self>) -> Observer {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.observers.lock().insert(id, tx);
        tracing::debug!(observer = id, "observer registered");
        Observer { id, rx, bus: Arc::downgrade(self) }
    }

    pub fn deregister(&self, id: ObserverId) {
        if self.observers.lock().remove(&id).is_some() {
            tracing::debug!(observer = id, "observer deregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// push `message` to every observer without blocking
    pub fn publish(&self, message: &Message) {
        let mut observers = self.observers.lock();
        observers.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(observer = *id, message = message.id, "observer queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

pub struct Observer {
    id: ObserverId,
    rx: mpsc::Receiver<Message>,
    bus: Weak<EventBus>,
}

impl Observer {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// next published message; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.deregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Peer;

    #[tokio::test]
    async fn every_observer_receives_published_messages() {
        let bus = EventBus::new(4);
        let mut a = bus.register();
        let mut b = bus.register();

        let msg = Message::log(Peer::loopback("node-1"), "hello");
        bus.publish(&msg);

        assert_eq!(a.recv().await, Some(msg.clone()));
        assert_eq!(b.recv().await, Some(msg));
    }

    #[tokio::test]
    async fn full_queues_drop_instead_of_blocking() {
        let bus = EventBus::new(1);
        let mut observer = bus.register();

        let first = Message::log(Peer::loopback("node-1"), "first");
        bus.publish(&first);
        bus.publish(&Message::log(Peer::loopback("node-1"), "second"));

        assert_eq!(observer.recv().await, Some(first));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn dropping_an_observer_deregisters_it() {
        let bus = EventBus::new(4);
        let observer = bus.register();
        assert_eq!(bus.len(), 1);
        drop(observer);
        assert!(bus.is_empty());
    }
}
