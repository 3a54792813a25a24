//! # history
//!
//! why: new watchers get the recent past before the live stream
//! relations: fourth stage of the wal chain; publishes live messages on the EventBus
//! what: Ring, HistoryTranscoder

use super::transcoder::{ApplyContext, Transcoder};
use super::Ledger;
use crate::bus::EventBus;
use fleet_core::{Event, Message, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Fixed-capacity circular buffer; the oldest element is overwritten.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    slots: Vec<Option<T>>,
    next: usize,
    len: usize,
}

impl<T: Clone> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![None; capacity.max(1)], next: 0, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) {
        let capacity = self.capacity();
        self.slots[self.next] = Some(value);
        self.next = (self.next + 1) % capacity;
        self.len = (self.len + 1).min(capacity);
    }

    /// oldest to newest
    pub fn to_vec(&self) -> Vec<T> {
        let capacity = self.capacity();
        let start = (self.next + capacity - self.len) % capacity;
        (0..self.len)
            .filter_map(|offset| self.slots[(start + offset) % capacity].clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.next = 0;
        self.len = 0;
    }
}

/// Records visible messages and publishes them to live observers.
pub struct HistoryTranscoder {
    ring: Mutex<Ring<Message>>,
    bus: Arc<EventBus>,
}

impl HistoryTranscoder {
    pub fn new(capacity: usize, bus: Arc<EventBus>) -> Self {
        Self { ring: Mutex::new(Ring::new(capacity)), bus }
    }

    /// recorded messages, oldest first
    pub fn replay(&self) -> Vec<Message> {
        self.ring.lock().to_vec()
    }
}

impl Transcoder for HistoryTranscoder {
    fn decode(&self, ctx: &ApplyContext, _ledger: &mut Ledger, message: &Message) -> Result<()> {
        if message.hidden || matches!(message.event, Event::History(_)) {
            return Ok(());
        }

        self.ring.lock().push(message.clone());

        // replayed entries were already seen by anyone watching
        if !ctx.recovering {
            self.bus.publish(message);
        }
        Ok(())
    }

    fn reset(&self) {
        self.ring.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Peer;

    #[test]
    fn ring_keeps_newest_in_order() {
        let mut ring = Ring::new(3);
        for i in 1..=5 {
            ring.push(i);
        }
        assert_eq!(ring.to_vec(), vec![3, 4, 5]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn partially_filled_ring() {
        let mut ring = Ring::new(4);
        ring.push('a');
        ring.push('b');
        assert_eq!(ring.to_vec(), vec!['a', 'b']);
        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn hidden_messages_are_not_recorded() {
        let history = HistoryTranscoder::new(8, EventBus::new(4));
        let origin = Peer::loopback("node-1");

        history.decode(&ApplyContext::live(), &mut Ledger::default(), &Message::log(origin.clone(), "seen")).unwrap();
        history.decode(&ApplyContext::live(), &mut Ledger::default(), &Message::log(origin, "unseen").hidden()).unwrap();

        assert_eq!(history.replay().len(), 1);
    }

    #[tokio::test]
    async fn recovery_records_without_publishing() {
        let bus = EventBus::new(4);
        let mut observer = bus.register();
        let history = HistoryTranscoder::new(8, Arc::clone(&bus));
        let origin = Peer::loopback("node-1");

        history.decode(&ApplyContext::recovering(), &mut Ledger::default(), &Message::log(origin.clone(), "replayed")).unwrap();
        let live = Message::log(origin, "live");
        history.decode(&ApplyContext::live(), &mut Ledger::default(), &live).unwrap();

        assert_eq!(history.replay().len(), 2);
        assert_eq!(observer.recv().await, Some(live));
    }
}
