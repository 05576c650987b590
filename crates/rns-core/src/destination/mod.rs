//! Named, typed endpoints.
//!
//! `Direction`/`DestinationKind` are runtime fields rather than a
//! phantom-typed `Destination<I, D, T>` generic: the router needs to hold
//! destinations of mixed direction/type in one table, which a typestate
//! encoding fights rather than helps.

pub mod ratchet;

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use rand_core::{CryptoRng, RngCore};

use crate::hash::{AddressHash, Hash, NameHash};
use crate::identity::{validate_announce, AnnounceInfo, Identity, PrivateIdentity};
use crate::packet::{
    DestinationType as WireDestinationType, Flags, HeaderType, Packet, PacketContext, PacketType,
    PropagationType,
};

pub use ratchet::{Ratchet, RatchetStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Single,
    Group,
    Plain,
    Link,
}

impl From<DestinationKind> for WireDestinationType {
    fn from(kind: DestinationKind) -> Self {
        match kind {
            DestinationKind::Single => WireDestinationType::Single,
            DestinationKind::Group => WireDestinationType::Group,
            DestinationKind::Plain => WireDestinationType::Plain,
            DestinationKind::Link => WireDestinationType::Link,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStrategy {
    ProveNone,
    ProveAll,
    ProveApp,
}

/// `name_hash_input = app_name + "." + aspects.join(".")`.
pub fn name_hash_input(app_name: &str, aspects: &[String]) -> String {
    if aspects.is_empty() {
        app_name.to_string()
    } else {
        alloc::format!("{app_name}.{}", aspects.join("."))
    }
}

/// `destination_hash = trunc16(sha256(name_hash(...) || identity_hash))` for
/// SINGLE destinations; GROUP/PLAIN omit the identity contribution.
pub fn destination_hash(
    kind: DestinationKind,
    name_hash: &NameHash,
    identity_hash: Option<&AddressHash>,
) -> AddressHash {
    let mut preimage = Vec::with_capacity(10 + 16);
    preimage.extend_from_slice(name_hash.as_slice());
    match kind {
        DestinationKind::Single => {
            if let Some(h) = identity_hash {
                preimage.extend_from_slice(h.as_slice());
            }
        }
        DestinationKind::Group | DestinationKind::Plain | DestinationKind::Link => {}
    }
    Hash::of(&preimage).truncate16()
}

/// A locally-owned destination capable of announcing and decrypting inbound
/// SINGLE traffic.
pub struct LocalDestination {
    pub identity: PrivateIdentity,
    pub app_name: String,
    pub aspects: Vec<String>,
    pub direction: Direction,
    pub kind: DestinationKind,
    pub proof_strategy: ProofStrategy,
    pub name_hash: NameHash,
    pub hash: AddressHash,
    pub ratchets: RatchetStore,
    pub enforce_ratchets: bool,
}

impl LocalDestination {
    pub fn new(identity: PrivateIdentity, app_name: &str, aspects: &[&str]) -> Self {
        let aspects: Vec<String> = aspects.iter().map(|a| a.to_string()).collect();
        let name_hash = NameHash::of(&name_hash_input(app_name, &aspects));
        let hash = destination_hash(DestinationKind::Single, &name_hash, Some(&identity.hash()));
        Self {
            identity,
            app_name: app_name.to_string(),
            aspects,
            direction: Direction::In,
            kind: DestinationKind::Single,
            proof_strategy: ProofStrategy::ProveNone,
            name_hash,
            hash,
            ratchets: RatchetStore::new(),
            enforce_ratchets: false,
        }
    }

    pub fn enable_ratchets(&mut self) {
        self.ratchets.enabled = true;
    }

    pub fn set_retained_ratchets(&mut self, retained: usize) {
        self.ratchets.retained = retained;
    }

    pub fn set_ratchet_interval_secs(&mut self, secs: u64) {
        self.ratchets.interval_secs = secs;
    }

    pub fn enforce_ratchets(&mut self, enforce: bool) {
        self.enforce_ratchets = enforce;
    }

    pub fn decrypt_with_ratchets(&self, ciphertext: &[u8]) -> Result<Vec<u8>, crate::error::IdentityError> {
        let ratchet_keys: Vec<[u8; 32]> = self.ratchets.active_keys();
        self.identity.decrypt(ciphertext, &ratchet_keys, self.enforce_ratchets)
    }

    pub fn should_prove(&self, app_wants_proof: bool) -> bool {
        match self.proof_strategy {
            ProofStrategy::ProveNone => false,
            ProofStrategy::ProveAll => true,
            ProofStrategy::ProveApp => app_wants_proof,
        }
    }

    /// Builds the ANNOUNCE packet: payload
    /// `public_key || name_hash || random_hash(10) || [ratchet(32)] ||
    /// signature(64) || app_data?`, signature over
    /// `destination_hash || public_key || name_hash || random_hash ||
    /// ratchet || app_data`.
    pub fn announce<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        app_data: Option<&[u8]>,
        ratchet: Option<[u8; 32]>,
    ) -> Packet {
        let public_key = self.identity.public().to_public_bytes();
        let mut random_hash = [0u8; 10];
        rng.fill_bytes(&mut random_hash);
        let app_data = app_data.unwrap_or(&[]);

        let mut signed = Vec::new();
        signed.extend_from_slice(self.hash.as_slice());
        signed.extend_from_slice(&public_key);
        signed.extend_from_slice(self.name_hash.as_slice());
        signed.extend_from_slice(&random_hash);
        if let Some(r) = ratchet {
            signed.extend_from_slice(&r);
        }
        signed.extend_from_slice(app_data);
        let signature = self.identity.sign(&signed);

        let mut payload = Vec::new();
        payload.extend_from_slice(&public_key);
        payload.extend_from_slice(self.name_hash.as_slice());
        payload.extend_from_slice(&random_hash);
        if let Some(r) = ratchet {
            payload.extend_from_slice(&r);
        }
        payload.extend_from_slice(&signature);
        payload.extend_from_slice(app_data);

        Packet {
            flags: Flags {
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: self.kind.into(),
                packet_type: PacketType::Announce,
                context_flag: if ratchet.is_some() { 1 } else { 0 },
            },
            hops: 0,
            transport_id: None,
            destination: self.hash,
            context: PacketContext::None,
            payload,
        }
    }
}

/// Parses and verifies an ANNOUNCE packet's payload.
pub fn validate_announce_packet(packet: &Packet) -> Result<AnnounceInfo, crate::error::IdentityError> {
    let has_ratchet = packet.flags.context_flag & 1 != 0;
    let info = validate_announce(&packet.payload, has_ratchet)?;
    if info.destination_hash != packet.destination {
        return Err(crate::error::IdentityError::AnnounceDestinationMismatch);
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn announce_round_trips_through_validate() {
        let mut rng = OsRng;
        let identity = PrivateIdentity::generate(&mut rng);
        let dest = LocalDestination::new(identity, "test", &["a"]);
        let packet = dest.announce(&mut rng, Some(b"hi"), None);

        let info = validate_announce_packet(&packet).expect("valid announce");
        assert_eq!(info.destination_hash, dest.hash);
        assert_eq!(info.app_data, b"hi");
    }

    #[test]
    fn announce_with_ratchet_round_trips() {
        let mut rng = OsRng;
        let identity = PrivateIdentity::generate(&mut rng);
        let dest = LocalDestination::new(identity, "test", &["a"]);
        let ratchet = [7u8; 32];
        let packet = dest.announce(&mut rng, None, Some(ratchet));

        let info = validate_announce_packet(&packet).expect("valid announce");
        assert_eq!(info.ratchet, Some(ratchet));
    }
}
