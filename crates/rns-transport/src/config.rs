//! Tunable defaults: timeouts, TTLs, ring sizes, announce budget. No
//! user-facing config-file schema — this is a plain, programmatically-built
//! struct, serde-derived so an embedder can persist/load it in whatever
//! format it likes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Periodic maintenance tick. Default 250ms (servers); set higher
    /// (e.g. 15 min) on energy-constrained nodes.
    pub maintenance_interval_ms: u64,
    /// Announce retransmit budget, percent of interface bandwidth.
    pub announce_bandwidth_budget_pct: f32,
    /// Token-bucket burst multiplier over the steady-state rate.
    pub announce_burst_multiplier: f32,
    pub dedup_ring_capacity: usize,
    pub dedup_ring_floor: usize,
    pub dedup_ring_ceiling: usize,
    /// Path table entry TTL, seconds.
    pub path_ttl_secs: u64,
    pub link_keepalive_interval_secs: u64,
    pub link_keepalive_timeout_secs: u64,
    /// Base handshake/receipt timeout plus per-hop and slack terms.
    pub timeout_base_ms: u64,
    pub timeout_per_hop_ms: u64,
    pub timeout_slack_ms: u64,
    pub max_resource_size_bytes: u64,
    pub known_destinations_path: Option<std::path::PathBuf>,
    pub ratchet_store_dir: Option<std::path::PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: 250,
            announce_bandwidth_budget_pct: 2.0,
            announce_burst_multiplier: 4.0,
            dedup_ring_capacity: 100_000,
            dedup_ring_floor: 50_000,
            dedup_ring_ceiling: 1_000_000,
            path_ttl_secs: 7 * 24 * 60 * 60,
            link_keepalive_interval_secs: 360,
            link_keepalive_timeout_secs: 720,
            timeout_base_ms: 5_000,
            timeout_per_hop_ms: 2_000,
            timeout_slack_ms: 1_000,
            max_resource_size_bytes: 64 * 1024 * 1024,
            known_destinations_path: None,
            ratchet_store_dir: None,
        }
    }
}

impl TransportConfig {
    pub fn with_maintenance_interval_ms(mut self, ms: u64) -> Self {
        self.maintenance_interval_ms = ms;
        self
    }

    pub fn with_dedup_ring_capacity(mut self, capacity: usize) -> Self {
        self.dedup_ring_capacity = capacity.clamp(self.dedup_ring_floor, self.dedup_ring_ceiling);
        self
    }

    pub fn with_known_destinations_path(mut self, path: std::path::PathBuf) -> Self {
        self.known_destinations_path = Some(path);
        self
    }

    pub fn with_ratchet_store_dir(mut self, path: std::path::PathBuf) -> Self {
        self.ratchet_store_dir = Some(path);
        self
    }

    /// `timeout = base + hops * per_hop + slack`.
    pub fn deadline(&self, hops: u8) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.timeout_base_ms + hops as u64 * self.timeout_per_hop_ms + self.timeout_slack_ms,
        )
    }
}
