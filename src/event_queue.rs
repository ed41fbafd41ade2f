//! EventQueue (C2): time-ordered bounded queue with overflow policy.
//!
//! Keyed by `(timestamp_ns, seq)` in a `BTreeMap`, the same "sorted map,
//! O(log n) insert/remove, iterate in key order" shape as the teacher's
//! `engine.rs` order book — reused here for time instead of price.
//! Single producer (the session's DataSource feeder), single consumer (the
//! session loop), per spec §5.

use crate::config::OverflowPolicy;
use crate::core_types::{Nanos, Seq};
use crate::event::Event;
use std::collections::BTreeMap;

pub struct EventQueue {
    capacity: usize,
    policy: OverflowPolicy,
    entries: BTreeMap<(Nanos, Seq), Event>,
    drop_count: u64,
}

impl EventQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity,
            policy,
            entries: BTreeMap::new(),
            drop_count: 0,
        }
    }

    /// Pushes an event. Never blocks: if full, the loser (oldest or the
    /// incoming event, per `policy`) is dropped and counted.
    pub fn push(&mut self, event: Event) {
        if self.entries.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropNewest => {
                    self.drop_count += 1;
                    return;
                }
                OverflowPolicy::DropOldest => {
                    if let Some((&oldest_key, _)) = self.entries.iter().next() {
                        self.entries.remove(&oldest_key);
                        self.drop_count += 1;
                    }
                }
            }
        }
        self.entries.insert(event.key(), event);
    }

    /// Pops the earliest event by `(timestamp_ns, seq)`, or `None` if empty.
    /// Never blocks.
    pub fn pop(&mut self) -> Option<Event> {
        let key = *self.entries.keys().next()?;
        self.entries.remove(&key)
    }

    pub fn peek(&self) -> Option<&Event> {
        self.entries.values().next()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Symbol;
    use crate::event::{EventPayload, QuoteData};
    use crate::money::Price;
    use rust_decimal::Decimal;

    fn ev(ts: Nanos, seq: Seq) -> Event {
        Event {
            timestamp_ns: ts,
            symbol: Symbol::new("AAPL"),
            seq,
            payload: EventPayload::Quote(QuoteData {
                bid: Price::new(Decimal::from(100)),
                bid_size: 1,
                ask: Price::new(Decimal::from(101)),
                ask_size: 1,
            }),
        }
    }

    #[test]
    fn pops_in_timestamp_then_seq_order() {
        let mut q = EventQueue::new(10, OverflowPolicy::DropOldest);
        q.push(ev(100, 2));
        q.push(ev(100, 1));
        q.push(ev(50, 5));
        assert_eq!(q.pop().unwrap().key(), (50, 5));
        assert_eq!(q.pop().unwrap().key(), (100, 1));
        assert_eq!(q.pop().unwrap().key(), (100, 2));
        assert!(q.pop().is_none());
    }

    #[test]
    fn drop_oldest_preserves_newest_n() {
        let mut q = EventQueue::new(2, OverflowPolicy::DropOldest);
        q.push(ev(1, 1));
        q.push(ev(2, 2));
        q.push(ev(3, 3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.drop_count(), 1);
        assert_eq!(q.pop().unwrap().key(), (2, 2));
        assert_eq!(q.pop().unwrap().key(), (3, 3));
    }

    #[test]
    fn drop_newest_rejects_the_arrival() {
        let mut q = EventQueue::new(2, OverflowPolicy::DropNewest);
        q.push(ev(1, 1));
        q.push(ev(2, 2));
        q.push(ev(3, 3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.drop_count(), 1);
        assert_eq!(q.pop().unwrap().key(), (1, 1));
        assert_eq!(q.pop().unwrap().key(), (2, 2));
    }

    #[test]
    fn never_blocks_on_empty() {
        let mut q = EventQueue::new(10, OverflowPolicy::DropOldest);
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }
}
