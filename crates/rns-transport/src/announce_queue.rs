//! Interface-scoped announce queue with a rate-limited retransmit budget.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rns_core::AddressHash;

#[derive(Clone)]
pub struct AnnounceQueueEntry {
    pub destination_hash: AddressHash,
    pub packet_bytes: Vec<u8>,
    pub received_on_interface: Option<String>,
    pub arrival_timestamp: u64,
    pub hops: u8,
}

/// A 1-second-granularity token bucket, burstable to
/// `burst_multiplier * rate_per_second`.
struct TokenBucket {
    tokens: f64,
    rate_per_second: f64,
    capacity: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_second: f64, burst_multiplier: f64) -> Self {
        let capacity = rate_per_second * burst_multiplier;
        Self { tokens: capacity, rate_per_second, capacity, last_refill: Instant::now() }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_second).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant, cost: f64) -> bool {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// One FIFO queue plus a bandwidth-budget bucket per outgoing interface.
pub struct AnnounceQueue {
    max_len: usize,
    queues: HashMap<String, VecDeque<AnnounceQueueEntry>>,
    buckets: HashMap<String, TokenBucket>,
    budget_pct: f32,
    burst_multiplier: f32,
}

impl AnnounceQueue {
    pub fn new(max_len: usize, budget_pct: f32, burst_multiplier: f32) -> Self {
        Self {
            max_len,
            queues: HashMap::new(),
            buckets: HashMap::new(),
            budget_pct,
            burst_multiplier,
        }
    }

    fn bucket_for(&mut self, interface: &str, interface_bitrate: u64) -> &mut TokenBucket {
        self.buckets.entry(interface.to_string()).or_insert_with(|| {
            let rate_per_second = interface_bitrate as f64 * (self.budget_pct as f64 / 100.0) / 8.0;
            TokenBucket::new(rate_per_second.max(1.0), self.burst_multiplier as f64)
        })
    }

    /// Enqueues `entry` for retransmission on `interface`. Drops with a
    /// `false` return (caller logs) when the per-interface queue is
    /// saturated.
    pub fn enqueue(&mut self, interface: &str, entry: AnnounceQueueEntry) -> bool {
        let queue = self.queues.entry(interface.to_string()).or_default();
        if queue.len() >= self.max_len {
            return false;
        }
        queue.push_back(entry);
        true
    }

    /// Pops and returns announces this interface's token bucket can afford
    /// right now, in FIFO order.
    pub fn drain_ready(&mut self, interface: &str, interface_bitrate: u64, now: Instant) -> Vec<AnnounceQueueEntry> {
        let mut drained = Vec::new();
        let Some(queue) = self.queues.get_mut(interface) else { return drained };
        while let Some(front) = queue.front() {
            let cost = front.packet_bytes.len() as f64;
            let affordable = self.bucket_for(interface, interface_bitrate).try_take(now, cost);
            if !affordable {
                break;
            }
            drained.push(queue.pop_front().expect("front just peeked"));
        }
        drained
    }

    pub fn queue_len(&self, interface: &str) -> usize {
        self.queues.get(interface).map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved_per_interface() {
        let mut queue = AnnounceQueue::new(16, 2.0, 4.0);
        for i in 0..3u8 {
            queue.enqueue(
                "if0",
                AnnounceQueueEntry {
                    destination_hash: AddressHash::from_bytes([i; 16]),
                    packet_bytes: vec![0u8; 10],
                    received_on_interface: None,
                    arrival_timestamp: i as u64,
                    hops: 0,
                },
            );
        }
        let drained = queue.drain_ready("if0", 10_000_000_000, Instant::now());
        let hops: Vec<u8> = drained.iter().map(|e| e.destination_hash.as_bytes()[0]).collect();
        assert_eq!(hops, vec![0, 1, 2]);
    }

    #[test]
    fn saturated_queue_drops_new_entries() {
        let mut queue = AnnounceQueue::new(1, 2.0, 4.0);
        assert!(queue.enqueue(
            "if0",
            AnnounceQueueEntry {
                destination_hash: AddressHash::from_bytes([0u8; 16]),
                packet_bytes: vec![],
                received_on_interface: None,
                arrival_timestamp: 0,
                hops: 0,
            }
        ));
        assert!(!queue.enqueue(
            "if0",
            AnnounceQueueEntry {
                destination_hash: AddressHash::from_bytes([1u8; 16]),
                packet_bytes: vec![],
                received_on_interface: None,
                arrival_timestamp: 1,
                hops: 0,
            }
        ));
    }

    #[test]
    fn zero_bandwidth_budget_blocks_drain() {
        let mut queue = AnnounceQueue::new(16, 2.0, 4.0);
        queue.enqueue(
            "if0",
            AnnounceQueueEntry {
                destination_hash: AddressHash::from_bytes([0u8; 16]),
                packet_bytes: vec![0u8; 10_000],
                received_on_interface: None,
                arrival_timestamp: 0,
                hops: 0,
            },
        );
        // A near-zero bitrate interface cannot afford a 10KB announce
        // immediately.
        let drained = queue.drain_ready("if0", 1, Instant::now());
        assert!(drained.is_empty());
    }
}
