//! The link state machine.
//!
//! Expressed as a pure state machine driven by inbound packets and timer
//! ticks rather than an async task: `Link` never does I/O itself. It
//! produces packets for the transport to send and consumes packets/ticks
//! the transport hands it. A `Link` holds only the `AddressHash` of its
//! attached destination, never a reference to it, to keep the object graph
//! acyclic.

use std::time::{Duration, Instant};

use rand_core::{CryptoRng, RngCore};
use rns_core::hash::{AddressHash, Hash};
use rns_core::identity::{Identity, PrivateIdentity};
use rns_core::packet::{
    DestinationType, Flags, HeaderType, Packet, PacketContext, PacketType, PropagationType,
};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::LinkError;
use crate::resource::{self, Advertisement, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Pending,
    Handshake,
    Active,
    Stale,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Full,
    Resource,
    Accumulator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HandshakeTimeout,
    ProofInvalid,
    Remote,
    KeepaliveTimeout,
    LocalTeardown,
}

impl From<CloseReason> for LinkError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::HandshakeTimeout => LinkError::HandshakeTimeout,
            CloseReason::ProofInvalid => LinkError::ProofInvalid,
            CloseReason::Remote => LinkError::PeerClosed,
            CloseReason::KeepaliveTimeout => LinkError::KeepaliveTimeout,
            CloseReason::LocalTeardown => LinkError::LocalTeardown,
        }
    }
}

/// 3 signalling bytes, big-endian: `bits 23..21 = mode, bits 20..0 = MTU`.
fn encode_signalling(mode: LinkMode, mtu: u32) -> [u8; 3] {
    let mode_bits: u32 = match mode {
        LinkMode::Full => 0,
        LinkMode::Resource => 1,
        LinkMode::Accumulator => 2,
    };
    let word = (mode_bits << 21) | (mtu & 0x1F_FFFF);
    [(word >> 16) as u8, (word >> 8) as u8, word as u8]
}

fn decode_signalling(bytes: &[u8; 3]) -> (LinkMode, u32) {
    let word = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32;
    let mode = match (word >> 21) & 0b111 {
        1 => LinkMode::Resource,
        2 => LinkMode::Accumulator,
        _ => LinkMode::Full,
    };
    (mode, word & 0x1F_FFFF)
}

pub struct Link {
    pub link_id: AddressHash,
    pub role: LinkRole,
    pub state: LinkState,
    ephemeral_priv: StaticSecret,
    ephemeral_pub: PublicKey,
    peer_ephemeral_pub: Option<PublicKey>,
    peer_identity: Option<Identity>,
    derived_key: Option<[u8; 64]>,
    pub mtu: u32,
    pub mode: LinkMode,
    pub rtt_estimate: Duration,
    pub last_activity: Instant,
    pub attached_destination: Option<AddressHash>,
    remote_destination: AddressHash,
    close_reason: Option<CloseReason>,
    /// At most one outbound transfer and one inbound transfer at a time: a
    /// resource is layered over this link, not multiplexed within it.
    resource_sender: Option<Sender>,
    resource_receiver: Option<Receiver>,
}

impl Link {
    /// Step 1-2 of the initiator handshake: generate ephemeral keys and
    /// build the LINKREQUEST packet. `link_id` is filled in by the caller
    /// once the packet bytes are known (it is the hash of the packet
    /// itself), via [`Link::finish_initiate`].
    pub fn initiate<R: RngCore + CryptoRng>(
        rng: &mut R,
        remote_destination: AddressHash,
        mtu: u32,
        mode: LinkMode,
        now: Instant,
    ) -> (Self, Packet) {
        let ephemeral_priv = StaticSecret::random_from_rng(&mut *rng);
        let ephemeral_pub = PublicKey::from(&ephemeral_priv);
        let signalling = encode_signalling(mode, mtu);

        let mut payload = Vec::with_capacity(32 + 3);
        payload.extend_from_slice(ephemeral_pub.as_bytes());
        payload.extend_from_slice(&signalling);

        let packet = Packet {
            flags: Flags {
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::LinkRequest,
                context_flag: 0,
            },
            hops: 0,
            transport_id: None,
            destination: remote_destination,
            context: PacketContext::None,
            payload,
        };

        let link = Self {
            link_id: AddressHash::zero(), // filled by finish_initiate
            role: LinkRole::Initiator,
            state: LinkState::Pending,
            ephemeral_priv,
            ephemeral_pub,
            peer_ephemeral_pub: None,
            peer_identity: None,
            derived_key: None,
            mtu,
            mode,
            rtt_estimate: Duration::from_millis(500),
            last_activity: now,
            attached_destination: None,
            remote_destination,
            close_reason: None,
            resource_sender: None,
            resource_receiver: None,
        };
        (link, packet)
    }

    /// `link_id = trunc16(sha256(link_request_packet_bytes))`, computed
    /// once the LINKREQUEST packet has been fully assembled.
    pub fn finish_initiate(&mut self, link_request_packet: &Packet) {
        self.link_id = Hash::of(&link_request_packet.to_bytes()).truncate16();
        self.state = LinkState::Handshake;
    }

    /// Responder handshake steps 1-5: parse the LINKREQUEST, derive the
    /// shared key, and build the LRPROOF packet.
    #[allow(clippy::too_many_arguments)]
    pub fn respond<R: RngCore + CryptoRng>(
        rng: &mut R,
        link_request_packet: &Packet,
        owning_identity: &PrivateIdentity,
        now: Instant,
    ) -> Result<(Self, Packet), LinkError> {
        if link_request_packet.payload.len() < 32 + 3 {
            return Err(LinkError::ProofInvalid);
        }
        let peer_ephemeral_pub: [u8; 32] =
            link_request_packet.payload[..32].try_into().expect("checked length above");
        let peer_ephemeral_pub = PublicKey::from(peer_ephemeral_pub);
        let signalling: [u8; 3] =
            link_request_packet.payload[32..35].try_into().expect("checked length above");
        let (mode, mtu) = decode_signalling(&signalling);

        let link_id = Hash::of(&link_request_packet.to_bytes()).truncate16();

        let ephemeral_priv = StaticSecret::random_from_rng(&mut *rng);
        let ephemeral_pub = PublicKey::from(&ephemeral_priv);
        let shared = ephemeral_priv.diffie_hellman(&peer_ephemeral_pub);
        let derived_key = crate::derive_link_key(shared.as_bytes(), link_id.as_slice());

        let identity_pub = owning_identity.public().to_public_bytes();
        let mut to_sign = Vec::with_capacity(16 + 32 + 64);
        to_sign.extend_from_slice(link_id.as_slice());
        to_sign.extend_from_slice(ephemeral_pub.as_bytes());
        to_sign.extend_from_slice(&identity_pub);
        to_sign.extend_from_slice(&signalling);
        let signature = owning_identity.sign(&to_sign);

        let mut payload = Vec::with_capacity(32 + 64 + 3 + 64);
        payload.extend_from_slice(ephemeral_pub.as_bytes());
        payload.extend_from_slice(&identity_pub);
        payload.extend_from_slice(&signalling);
        payload.extend_from_slice(&signature);

        let proof_packet = Packet {
            flags: Flags {
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Link,
                packet_type: PacketType::Proof,
                context_flag: 0,
            },
            hops: 0,
            transport_id: None,
            destination: link_id,
            context: PacketContext::LinkRequestProof,
            payload,
        };

        let link = Self {
            link_id,
            role: LinkRole::Responder,
            state: LinkState::Active,
            ephemeral_priv,
            ephemeral_pub,
            peer_ephemeral_pub: Some(peer_ephemeral_pub),
            peer_identity: None,
            derived_key: Some(derived_key),
            mtu,
            mode,
            rtt_estimate: Duration::from_millis(500),
            last_activity: now,
            attached_destination: None,
            remote_destination: link_request_packet.destination,
            close_reason: None,
            resource_sender: None,
            resource_receiver: None,
        };
        Ok((link, proof_packet))
    }

    /// Initiator side: verify the LRPROOF signature against the
    /// destination's identity, then derive the same key. On success,
    /// transitions to `Active`.
    pub fn handle_proof(
        &mut self,
        proof_packet: &Packet,
        remote_identity: &Identity,
        now: Instant,
    ) -> Result<(), LinkError> {
        if self.role != LinkRole::Initiator || self.state != LinkState::Handshake {
            return Err(LinkError::ProofInvalid);
        }
        let payload = &proof_packet.payload;
        if payload.len() < 32 + 64 + 3 + 64 {
            return Err(LinkError::ProofInvalid);
        }
        let peer_ephemeral_pub: [u8; 32] = payload[0..32].try_into().unwrap();
        let identity_pub: [u8; 64] = payload[32..96].try_into().unwrap();
        let signalling: [u8; 3] = payload[96..99].try_into().unwrap();
        let signature: [u8; 64] = payload[99..163].try_into().unwrap();

        if identity_pub != remote_identity.to_public_bytes() {
            return Err(LinkError::ProofInvalid);
        }

        let mut signed = Vec::with_capacity(16 + 32 + 64 + 3);
        signed.extend_from_slice(self.link_id.as_slice());
        signed.extend_from_slice(&peer_ephemeral_pub);
        signed.extend_from_slice(&identity_pub);
        signed.extend_from_slice(&signalling);
        remote_identity.verify(&signed, &signature).map_err(|_| LinkError::ProofInvalid)?;

        let peer_ephemeral_pub = PublicKey::from(peer_ephemeral_pub);
        let shared = self.ephemeral_priv.diffie_hellman(&peer_ephemeral_pub);
        let derived_key = crate::derive_link_key(shared.as_bytes(), self.link_id.as_slice());

        self.peer_ephemeral_pub = Some(peer_ephemeral_pub);
        self.peer_identity = Some(*remote_identity);
        self.derived_key = Some(derived_key);
        self.state = LinkState::Active;
        self.last_activity = now;
        Ok(())
    }

    pub fn derived_key(&self) -> Option<&[u8; 64]> {
        self.derived_key.as_ref()
    }

    fn token(&self) -> rns_core::crypt::Token {
        rns_core::crypt::Token::new(self.derived_key.as_ref().expect("link is active"))
    }

    /// Encrypts `plaintext` as a DATA frame payload: `Token(K, plaintext)`.
    pub fn encrypt_data<R: RngCore + CryptoRng>(&self, rng: &mut R, plaintext: &[u8]) -> Vec<u8> {
        self.token().encrypt(rng, plaintext)
    }

    pub fn decrypt_data(&mut self, ciphertext: &[u8], now: Instant) -> Result<Vec<u8>, LinkError> {
        let plaintext = self.token().decrypt(ciphertext).map_err(|_| LinkError::ProofInvalid)?;
        self.last_activity = now;
        self.state = LinkState::Active;
        Ok(plaintext)
    }

    pub fn remote_destination(&self) -> AddressHash {
        self.remote_destination
    }

    /// Maximum Data Unit: the largest plaintext a single DATA frame can
    /// carry on this link, after `Token` overhead and PKCS#7 padding to the
    /// next 16-byte block.
    pub fn mdu(&self) -> usize {
        let overhead = rns_core::crypt::token::OVERHEAD + 16;
        (self.mtu as usize).saturating_sub(overhead)
    }

    /// Whether this link should send a keepalive frame (idle for
    /// `keepalive_interval`) or has gone stale/should close (idle for
    /// `keepalive_timeout`, i.e. 2x the interval by default).
    pub fn check_keepalive(
        &mut self,
        now: Instant,
        keepalive_interval: Duration,
        keepalive_timeout: Duration,
    ) -> KeepaliveAction {
        let idle = now.duration_since(self.last_activity);
        if idle >= keepalive_timeout {
            if self.state == LinkState::Stale {
                self.state = LinkState::Closed;
                KeepaliveAction::Close(CloseReason::KeepaliveTimeout)
            } else {
                self.state = LinkState::Stale;
                KeepaliveAction::SendKeepalive
            }
        } else if idle >= keepalive_interval {
            KeepaliveAction::SendKeepalive
        } else {
            KeepaliveAction::None
        }
    }

    pub fn close(&mut self, reason: CloseReason) {
        self.state = LinkState::Closed;
        self.close_reason = Some(reason);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_active(&self) -> bool {
        self.state == LinkState::Active
    }

    /// Starts sending `plaintext` as a resource transfer: segments it,
    /// stores the sending state, and returns the ADV to encrypt and send.
    pub fn begin_sending_resource<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        plaintext: &[u8],
        max_size: u64,
    ) -> Result<Advertisement, LinkError> {
        let part_size = self.mdu().saturating_sub(resource::PART_HEADER_LEN).max(1);
        let (sender, advertisement) = Sender::new(rng, plaintext, part_size, max_size)
            .map_err(|_| LinkError::ProofInvalid)?;
        self.resource_sender = Some(sender);
        Ok(advertisement)
    }

    /// Responder side: produces the PART frames requested by an inbound REQ.
    pub fn resource_parts_for(&mut self, wanted: &[u16]) -> Option<Vec<Vec<u8>>> {
        self.resource_sender.as_mut().map(|sender| sender.parts_for(wanted))
    }

    /// Verifies an inbound PROOF against the active outbound transfer.
    pub fn verify_resource_proof(&mut self, proof: &[u8]) -> Result<(), LinkError> {
        let sender = self.resource_sender.as_mut().ok_or(LinkError::ProofInvalid)?;
        sender.verify_proof(proof).map_err(|_| LinkError::ProofInvalid)
    }

    /// Starts receiving a resource advertised by `advertisement`, returning
    /// the initial set of missing parts to request.
    pub fn begin_receiving_resource(
        &mut self,
        advertisement: Advertisement,
        max_size: u64,
    ) -> Result<Vec<u16>, LinkError> {
        let receiver =
            Receiver::new(advertisement, max_size).map_err(|_| LinkError::ProofInvalid)?;
        let missing = receiver.missing_parts();
        self.resource_receiver = Some(receiver);
        Ok(missing)
    }

    /// Ingests one PART frame. `Ok(Some(missing))` while parts remain
    /// outstanding, `Ok(None)` once the transfer is complete and ready for
    /// [`Link::conclude_resource`].
    pub fn ingest_resource_part(&mut self, frame: &[u8]) -> Result<Option<Vec<u16>>, LinkError> {
        let receiver = self.resource_receiver.as_mut().ok_or(LinkError::ProofInvalid)?;
        receiver.ingest_part(frame).map_err(|_| LinkError::ProofInvalid)?;
        if receiver.is_complete() {
            Ok(None)
        } else {
            Ok(Some(receiver.missing_parts()))
        }
    }

    /// Assembles the completed inbound transfer and clears its slot,
    /// returning the plaintext and the PROOF frame to send back.
    pub fn conclude_resource(&mut self) -> Result<(Vec<u8>, Vec<u8>), LinkError> {
        let receiver = self.resource_receiver.as_mut().ok_or(LinkError::ProofInvalid)?;
        let result = receiver.conclude().map_err(|_| LinkError::ProofInvalid)?;
        self.resource_receiver = None;
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    None,
    SendKeepalive,
    Close(CloseReason),
}
