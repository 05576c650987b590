//! Delivery receipts for locally-originated packets.

use std::collections::HashMap;
use std::time::Instant;

use rns_core::AddressHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptState {
    Sent,
    Delivered,
    Failed,
}

pub struct Receipt {
    pub truncated_packet_hash: AddressHash,
    pub timeout_at: Instant,
    pub state: ReceiptState,
}

/// Outcome handed to the caller-supplied callback when a receipt resolves.
pub enum ReceiptOutcome {
    Delivered,
    Failed,
}

pub struct ReceiptTable {
    entries: HashMap<AddressHash, Receipt>,
}

impl Default for ReceiptTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiptTable {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn track(&mut self, truncated_packet_hash: AddressHash, timeout_at: Instant) {
        self.entries.insert(
            truncated_packet_hash,
            Receipt { truncated_packet_hash, timeout_at, state: ReceiptState::Sent },
        );
    }

    /// Correlates an inbound PROOF by its destination (the truncated hash
    /// of the original packet). Fires at most once: a receipt already
    /// resolved is removed and further PROOFs for it are ignored.
    pub fn resolve_delivered(&mut self, truncated_hash: &AddressHash) -> bool {
        self.entries.remove(truncated_hash).is_some()
    }

    /// Sweeps receipts whose deadline has passed, returning them for the
    /// caller to invoke `on_failed` on (never `on_delivered` — a receipt
    /// fires at most once).
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<AddressHash> {
        let expired: Vec<AddressHash> = self
            .entries
            .values()
            .filter(|r| r.state == ReceiptState::Sent && now >= r.timeout_at)
            .map(|r| r.truncated_packet_hash)
            .collect();
        for hash in &expired {
            self.entries.remove(hash);
        }
        expired
    }

    pub fn cancel_all(&mut self) -> Vec<AddressHash> {
        let all: Vec<AddressHash> = self.entries.keys().copied().collect();
        self.entries.clear();
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn resolved_receipt_fires_at_most_once() {
        let mut table = ReceiptTable::new();
        let hash = AddressHash::from_bytes([1u8; 16]);
        table.track(hash, Instant::now() + Duration::from_secs(10));
        assert!(table.resolve_delivered(&hash));
        assert!(!table.resolve_delivered(&hash));
    }

    #[test]
    fn expired_receipts_are_swept() {
        let mut table = ReceiptTable::new();
        let hash = AddressHash::from_bytes([2u8; 16]);
        table.track(hash, Instant::now() - Duration::from_millis(1));
        let expired = table.sweep_timeouts(Instant::now());
        assert_eq!(expired, vec![hash]);
        assert!(table.is_empty());
    }
}
