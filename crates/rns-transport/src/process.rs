//! Process-root lifecycle and persisted state.
//!
//! Msgpack records, atomic temp+rename writes, lazily-loaded per-destination
//! ratchet files. Owned by [`crate::transport::Transport`], never a bare
//! global — there are no ambient singletons.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use rns_core::hash::AddressHash;

use crate::error::LifecycleError;

/// One entry of the `known_destinations` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownDestination {
    pub timestamp_ms: i64,
    #[serde(with = "serde_bytes")]
    pub packet_hash: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub app_data: Option<Vec<u8>>,
}

/// The `ratchets/<hex_destination_hash>` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRatchet {
    #[serde(with = "serde_bytes")]
    pub ratchet: Vec<u8>,
    pub received: f64,
}

/// Writes `value` to `path` atomically: serialize to a sibling `.tmp` file,
/// then rename over the destination.
fn write_atomic_msgpack<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = rmp_serde::to_vec_named(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&tmp_path, &bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_msgpack<T: for<'de> Deserialize<'de>>(path: &Path) -> std::io::Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(rmp_serde::from_slice(&bytes).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e)
        })?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Owns the two persisted artifacts: known destinations and per-destination
/// ratchets. `None` paths (the default) mean "in-memory only, no
/// persistence" — a valid configuration for embedders that manage
/// durability themselves.
pub struct Store {
    known_destinations_path: Option<PathBuf>,
    ratchet_store_dir: Option<PathBuf>,
}

impl Store {
    pub fn new(known_destinations_path: Option<PathBuf>, ratchet_store_dir: Option<PathBuf>) -> Self {
        Self { known_destinations_path, ratchet_store_dir }
    }

    pub fn load_known_destinations(&self) -> HashMap<AddressHash, KnownDestination> {
        let Some(path) = &self.known_destinations_path else { return HashMap::new() };
        let raw: Option<HashMap<[u8; 16], KnownDestination>> = read_msgpack(path).unwrap_or(None);
        raw.unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (AddressHash::from_bytes(k), v))
            .collect()
    }

    pub fn save_known_destinations(
        &self,
        destinations: &HashMap<AddressHash, KnownDestination>,
    ) -> std::io::Result<()> {
        let Some(path) = &self.known_destinations_path else { return Ok(()) };
        let raw: HashMap<[u8; 16], &KnownDestination> =
            destinations.iter().map(|(k, v)| (*k.as_bytes(), v)).collect();
        write_atomic_msgpack(path, &raw)
    }

    fn ratchet_path(&self, destination_hash: &AddressHash) -> Option<PathBuf> {
        self.ratchet_store_dir.as_ref().map(|dir| dir.join(destination_hash.to_hex_string()))
    }

    /// Loaded lazily on use.
    pub fn load_ratchet(&self, destination_hash: &AddressHash) -> Option<StoredRatchet> {
        let path = self.ratchet_path(destination_hash)?;
        read_msgpack(&path).ok().flatten()
    }

    pub fn save_ratchet(
        &self,
        destination_hash: &AddressHash,
        ratchet: &StoredRatchet,
    ) -> std::io::Result<()> {
        let Some(path) = self.ratchet_path(destination_hash) else { return Ok(()) };
        write_atomic_msgpack(&path, ratchet)
    }

    /// Deletes a destination's ratchet file (cleanup of an expired entry).
    pub fn delete_ratchet(&self, destination_hash: &AddressHash) -> std::io::Result<()> {
        let Some(path) = self.ratchet_path(destination_hash) else { return Ok(()) };
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    NotStarted,
    Started,
}

/// Tracks the `init`/`shutdown` lifecycle: started exactly once, shut down
/// at most once.
pub struct Lifecycle {
    state: RunState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self { state: RunState::NotStarted }
    }

    pub fn start(&mut self) -> Result<(), LifecycleError> {
        if self.state == RunState::Started {
            return Err(LifecycleError::AlreadyStarted);
        }
        self.state = RunState::Started;
        Ok(())
    }

    pub fn require_started(&self) -> Result<(), LifecycleError> {
        if self.state != RunState::Started {
            return Err(LifecycleError::NotStarted);
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state == RunState::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_destinations_round_trip_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_destinations");
        let store = Store::new(Some(path.clone()), None);

        let mut destinations = HashMap::new();
        destinations.insert(
            AddressHash::from_bytes([1u8; 16]),
            KnownDestination {
                timestamp_ms: 1_700_000_000_000,
                packet_hash: vec![2u8; 32],
                public_key: vec![3u8; 64],
                app_data: Some(b"hi".to_vec()),
            },
        );
        store.save_known_destinations(&destinations).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let loaded = store.load_known_destinations();
        assert_eq!(loaded.len(), 1);
        let entry = &loaded[&AddressHash::from_bytes([1u8; 16])];
        assert_eq!(entry.timestamp_ms, 1_700_000_000_000);
        assert_eq!(entry.app_data, Some(b"hi".to_vec()));
    }

    #[test]
    fn ratchet_file_uses_hex_destination_hash_as_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(None, Some(dir.path().to_path_buf()));
        let destination = AddressHash::from_bytes([0xabu8; 16]);

        assert!(store.load_ratchet(&destination).is_none());
        store
            .save_ratchet(&destination, &StoredRatchet { ratchet: vec![9u8; 32], received: 123.5 })
            .unwrap();

        let expected_path = dir.path().join(destination.to_hex_string());
        assert!(expected_path.exists());

        let loaded = store.load_ratchet(&destination).unwrap();
        assert_eq!(loaded.received, 123.5);

        store.delete_ratchet(&destination).unwrap();
        assert!(!expected_path.exists());
    }

    #[test]
    fn lifecycle_rejects_double_start() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.start().unwrap();
        assert_eq!(lifecycle.start(), Err(LifecycleError::AlreadyStarted));
    }

    #[test]
    fn lifecycle_requires_start_before_use() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.require_started(), Err(LifecycleError::NotStarted));
    }
}
