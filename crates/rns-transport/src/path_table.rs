//! Router-local path table and reverse table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rns_core::AddressHash;

#[derive(Clone)]
pub struct PathEntry {
    pub next_hop_interface: String,
    pub next_hop_transport_id: Option<AddressHash>,
    pub hops: u8,
    pub expires_at: Instant,
    pub latest_announce_packet_bytes: Vec<u8>,
    pub latest_announce_timestamp: u64,
    pub public_key: [u8; 64],
    /// For the tie-break rule: higher is preferred.
    pub interface_bitrate: u64,
}

pub struct PathTable {
    entries: HashMap<AddressHash, PathEntry>,
    ttl: Duration,
}

impl PathTable {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: HashMap::new(), ttl }
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&PathEntry> {
        self.entries.get(destination)
    }

    /// Applies the path-entry replacement invariant: replace only if
    /// `(new.hops, -new.ts) < (old.hops, -old.ts)` and the public key
    /// agrees with any stored one; else drop the candidate. Ties (equal
    /// hops and timestamp) are broken by higher bitrate, then lexicographic
    /// interface id (see DESIGN.md for the rationale).
    pub fn offer(&mut self, destination: AddressHash, candidate: PathEntry, now: Instant) -> bool {
        match self.entries.get(&destination) {
            None => {
                self.entries.insert(destination, candidate);
                true
            }
            Some(existing) => {
                if existing.public_key != candidate.public_key && existing.hops <= candidate.hops {
                    // A different key claiming a worse or equal path never
                    // displaces the incumbent.
                    return false;
                }
                let better = (candidate.hops, candidate.latest_announce_timestamp)
                    < (existing.hops, existing.latest_announce_timestamp)
                    || existing.public_key != candidate.public_key;
                let tie = candidate.hops == existing.hops
                    && candidate.latest_announce_timestamp == existing.latest_announce_timestamp;
                if better || (tie && Self::tie_break_prefers_candidate(existing, &candidate, now)) {
                    self.entries.insert(destination, candidate);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn tie_break_prefers_candidate(existing: &PathEntry, candidate: &PathEntry, _now: Instant) -> bool {
        if candidate.interface_bitrate != existing.interface_bitrate {
            return candidate.interface_bitrate > existing.interface_bitrate;
        }
        candidate.next_hop_interface < existing.next_hop_interface
    }

    pub fn cull_expired(&mut self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// `(ingress_interface, egress_interface, timestamp)` recorded for a
/// forwarded LINKREQUEST so its LRPROOF can return without a fresh lookup.
pub struct ReverseEntry {
    pub inbound_interface: String,
    pub outbound_interface: String,
    pub timestamp: Instant,
}

pub struct ReverseTable {
    entries: HashMap<[u8; 32], ReverseEntry>,
    ttl: Duration,
}

impl ReverseTable {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: HashMap::new(), ttl }
    }

    pub fn record(&mut self, packet_hash: [u8; 32], entry: ReverseEntry) {
        self.entries.insert(packet_hash, entry);
    }

    pub fn lookup(&self, packet_hash: &[u8; 32]) -> Option<&ReverseEntry> {
        self.entries.get(packet_hash)
    }

    pub fn cull_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| now.duration_since(e.timestamp) < ttl);
    }
}
