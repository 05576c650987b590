//! Deduplication ring: a bounded `packet_hash -> first_seen_ts` map,
//! FIFO-evicted on overflow.
//! Keyed by the full 32-byte packet hash rather than the 16-byte truncation
//! so cross-destination collisions stay astronomically unlikely even at
//! the 1M-entry ceiling.

use std::collections::{HashMap, VecDeque};

use rns_core::Hash;

pub struct DedupRing {
    capacity: usize,
    order: VecDeque<[u8; 32]>,
    seen: HashMap<[u8; 32], u64>,
}

impl DedupRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), order: VecDeque::new(), seen: HashMap::new() }
    }

    /// Returns `true` if `hash` was already present (the caller should
    /// drop the packet); inserts it either way.
    pub fn seen_or_insert(&mut self, hash: &Hash, now_secs: u64) -> bool {
        let key = *hash.as_bytes();
        if self.seen.contains_key(&key) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key);
        self.seen.insert(key, now_secs);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
