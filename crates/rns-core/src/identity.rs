//! Cryptographic identity: X25519 for encryption, Ed25519 for signing.
//!
//! `Identity` (public-only) / `PrivateIdentity` (full key pair) split, keys
//! derived into the fixed 64-byte `Token` key via HKDF-SHA-256, plus
//! `validate_announce` for verifying a received announce payload.

use alloc::vec::Vec;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::crypt::Token;
use crate::error::{CryptoError, IdentityError};
use crate::hash::{AddressHash, Hash, NameHash};

pub const X25519_KEY_LEN: usize = 32;
pub const ED25519_KEY_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = X25519_KEY_LEN + ED25519_KEY_LEN;
pub const PRIVATE_KEY_LEN: usize = X25519_KEY_LEN + ED25519_KEY_LEN;

/// `identity_hash = trunc16(sha256(x25519_pub || ed25519_pub))`.
fn identity_hash(x25519_pub: &[u8; 32], ed25519_pub: &[u8; 32]) -> AddressHash {
    Hash::of(&[x25519_pub.as_slice(), ed25519_pub.as_slice()].concat()).truncate16()
}

/// Public form of an identity: can verify and encrypt-to, but not sign or
/// decrypt.
#[derive(Clone, Copy)]
pub struct Identity {
    x25519_pub: PublicKey,
    ed25519_pub: VerifyingKey,
    hash: AddressHash,
}

/// Full identity including private key material.
#[derive(Clone)]
pub struct PrivateIdentity {
    x25519_priv: StaticSecret,
    ed25519_priv: SigningKey,
    public: Identity,
}

impl Identity {
    pub fn from_public_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return None;
        }
        let mut x_bytes = [0u8; 32];
        let mut e_bytes = [0u8; 32];
        x_bytes.copy_from_slice(&bytes[..32]);
        e_bytes.copy_from_slice(&bytes[32..]);
        let x25519_pub = PublicKey::from(x_bytes);
        let ed25519_pub = VerifyingKey::from_bytes(&e_bytes).ok()?;
        Some(Self { x25519_pub, ed25519_pub, hash: identity_hash(&x_bytes, &e_bytes) })
    }

    pub fn to_public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out[..32].copy_from_slice(self.x25519_pub.as_bytes());
        out[32..].copy_from_slice(self.ed25519_pub.as_bytes());
        out
    }

    pub fn to_hex_string(&self) -> alloc::string::String {
        hex::encode(self.to_public_bytes())
    }

    pub fn from_hex_string(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        Self::from_public_bytes(&bytes)
    }

    pub fn hash(&self) -> AddressHash {
        self.hash
    }

    pub fn x25519_public(&self) -> &PublicKey {
        &self.x25519_pub
    }

    pub fn ed25519_public(&self) -> &VerifyingKey {
        &self.ed25519_pub
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = Signature::from_bytes(signature);
        self.ed25519_pub.verify(message, &sig).map_err(|_| CryptoError::BadSignature)
    }

    /// Encrypt `plaintext` to this identity's static X25519 key, or to
    /// `ratchet` if given.
    pub fn encrypt<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
        ratchet: Option<&[u8; 32]>,
    ) -> Vec<u8> {
        let target = ratchet.map(|r| PublicKey::from(*r)).unwrap_or(self.x25519_pub);
        let ephemeral = EphemeralSecret::random_from_rng(&mut *rng);
        let ephemeral_pub = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&target);

        let key = derive_token_key(shared.as_bytes(), self.hash.as_slice());
        let token = Token::new(&key).encrypt(rng, plaintext);

        let mut out = Vec::with_capacity(32 + token.len());
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&token);
        out
    }
}

fn derive_token_key(shared_secret: &[u8], salt: &[u8]) -> [u8; 64] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut out = [0u8; 64];
    hk.expand(&[], &mut out).expect("64 bytes is within HKDF-SHA256's output limit");
    out
}

impl PrivateIdentity {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let x25519_priv = StaticSecret::random_from_rng(&mut *rng);
        let ed25519_priv = SigningKey::generate(rng);
        Self::from_keys(x25519_priv, ed25519_priv)
    }

    fn from_keys(x25519_priv: StaticSecret, ed25519_priv: SigningKey) -> Self {
        let x25519_pub = PublicKey::from(&x25519_priv);
        let ed25519_pub = ed25519_priv.verifying_key();
        let hash = identity_hash(x25519_pub.as_bytes(), ed25519_pub.as_bytes());
        Self {
            x25519_priv,
            ed25519_priv,
            public: Identity { x25519_pub, ed25519_pub, hash },
        }
    }

    /// `X25519_priv(32) || Ed25519_priv(32)`.
    pub fn from_private_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PRIVATE_KEY_LEN {
            return None;
        }
        let mut x_bytes = [0u8; 32];
        let mut e_bytes = [0u8; 32];
        x_bytes.copy_from_slice(&bytes[..32]);
        e_bytes.copy_from_slice(&bytes[32..]);
        Some(Self::from_keys(StaticSecret::from(x_bytes), SigningKey::from_bytes(&e_bytes)))
    }

    pub fn to_private_bytes(&self) -> [u8; PRIVATE_KEY_LEN] {
        let mut out = [0u8; PRIVATE_KEY_LEN];
        out[..32].copy_from_slice(&self.x25519_priv.to_bytes());
        out[32..].copy_from_slice(self.ed25519_priv.as_bytes());
        out
    }

    pub fn to_hex_string(&self) -> alloc::string::String {
        hex::encode(self.to_private_bytes())
    }

    pub fn from_hex_string(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        Self::from_private_bytes(&bytes)
    }

    pub fn public(&self) -> &Identity {
        &self.public
    }

    pub fn hash(&self) -> AddressHash {
        self.public.hash
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.ed25519_priv.sign(message).to_bytes()
    }

    pub fn x25519_private(&self) -> &StaticSecret {
        &self.x25519_priv
    }

    /// Tries, in order: `ratchets` (if `enforce_ratchets`, *only* these),
    /// then the static private key. The first key whose HMAC verifies wins.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        ratchets: &[[u8; 32]],
        enforce_ratchets: bool,
    ) -> Result<Vec<u8>, IdentityError> {
        if ciphertext.len() < 32 {
            return Err(CryptoError::Truncated.into());
        }
        let (ephemeral_pub_bytes, token) = ciphertext.split_at(32);
        let mut ephemeral_fixed = [0u8; 32];
        ephemeral_fixed.copy_from_slice(ephemeral_pub_bytes);
        let ephemeral_pub = PublicKey::from(ephemeral_fixed);

        let candidates: Vec<&StaticSecret> = if enforce_ratchets {
            Vec::new()
        } else {
            alloc::vec![&self.x25519_priv]
        };

        // Ratchets are tried first regardless of enforcement, then the
        // static key only when enforcement is off.
        for ratchet_bytes in ratchets {
            let ratchet_priv = StaticSecret::from(*ratchet_bytes);
            let shared = ratchet_priv.diffie_hellman(&ephemeral_pub);
            let key = derive_token_key(shared.as_bytes(), self.public.hash.as_slice());
            if let Ok(plaintext) = Token::new(&key).decrypt(token) {
                return Ok(plaintext);
            }
        }
        for candidate in candidates {
            let shared = candidate.diffie_hellman(&ephemeral_pub);
            let key = derive_token_key(shared.as_bytes(), self.public.hash.as_slice());
            if let Ok(plaintext) = Token::new(&key).decrypt(token) {
                return Ok(plaintext);
            }
        }

        Err(CryptoError::Hmac.into())
    }
}

/// Result of a successful `validate_announce`: the parsed and verified
/// announce fields, ready for insertion into the known-destinations map.
pub struct AnnounceInfo {
    pub destination_hash: AddressHash,
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub name_hash: NameHash,
    pub ratchet: Option<[u8; 32]>,
    pub app_data: Vec<u8>,
}

/// Parses and verifies an announce payload.
///
/// `payload = public_key(64) || name_hash(10) || random_hash(10) ||
/// [ratchet(32)] || signature(64) || app_data?`, `ratchet` present iff
/// `has_ratchet`. The signed region is
/// `destination_hash || public_key || name_hash || random_hash || ratchet || app_data`.
pub fn validate_announce(
    payload: &[u8],
    has_ratchet: bool,
) -> Result<AnnounceInfo, IdentityError> {
    const PK: usize = PUBLIC_KEY_LEN;
    const NH: usize = 10;
    const RH: usize = 10;
    let ratchet_len = if has_ratchet { 32 } else { 0 };
    let min_len = PK + NH + RH + ratchet_len + 64;
    if payload.len() < min_len {
        return Err(IdentityError::AnnounceTooShort);
    }

    let mut idx = 0;
    let public_key: [u8; PK] = payload[idx..idx + PK].try_into().unwrap();
    idx += PK;
    let name_hash = NameHash::from_slice(&payload[idx..idx + NH]).unwrap();
    idx += NH;
    let random_hash = &payload[idx..idx + RH];
    idx += RH;
    let ratchet: Option<[u8; 32]> = if has_ratchet {
        let r: [u8; 32] = payload[idx..idx + 32].try_into().unwrap();
        idx += 32;
        Some(r)
    } else {
        None
    };
    let signature: [u8; 64] = payload[idx..idx + 64].try_into().unwrap();
    idx += 64;
    let app_data = &payload[idx..];

    let identity = Identity::from_public_bytes(&public_key)
        .ok_or(IdentityError::Crypto(CryptoError::BadSignature))?;
    let destination_hash = Hash::of(
        &[name_hash.as_slice(), identity.hash().as_slice()].concat(),
    )
    .truncate16();

    let mut signed = Vec::with_capacity(min_len + 16);
    signed.extend_from_slice(destination_hash.as_slice());
    signed.extend_from_slice(&public_key);
    signed.extend_from_slice(name_hash.as_slice());
    signed.extend_from_slice(random_hash);
    if let Some(r) = ratchet {
        signed.extend_from_slice(&r);
    }
    signed.extend_from_slice(app_data);

    identity.verify(&signed, &signature)?;

    Ok(AnnounceInfo {
        destination_hash,
        public_key,
        name_hash,
        ratchet,
        app_data: app_data.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn encrypt_then_decrypt_roundtrips_for_arbitrary_plaintext() {
        let mut rng = OsRng;
        let identity = PrivateIdentity::generate(&mut rng);
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let ciphertext = identity.public().encrypt(&mut rng, plaintext, None);
        let decrypted = identity.decrypt(&ciphertext, &[], false).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_without_private_key_material_is_not_possible() {
        // `Identity` (public-only) has no decrypt method at all: this is
        // enforced at the type level, not at runtime.
        let mut rng = OsRng;
        let identity = PrivateIdentity::generate(&mut rng);
        let public_only = *identity.public();
        let _ = public_only.encrypt(&mut rng, b"x", None);
    }

    #[test]
    fn hex_round_trips_for_public_and_private_identity() {
        let mut rng = OsRng;
        let identity = PrivateIdentity::generate(&mut rng);

        let public_hex = identity.public().to_hex_string();
        let parsed_public = Identity::from_hex_string(&public_hex).unwrap();
        assert_eq!(parsed_public.to_public_bytes(), identity.public().to_public_bytes());

        let private_hex = identity.to_hex_string();
        let parsed_private = PrivateIdentity::from_hex_string(&private_hex).unwrap();
        assert_eq!(parsed_private.to_private_bytes(), identity.to_private_bytes());
    }

    #[test]
    fn bit_flipped_signature_rejects() {
        let mut rng = OsRng;
        let identity = PrivateIdentity::generate(&mut rng);
        let msg = b"hello";
        let mut sig = identity.sign(msg);
        sig[0] ^= 1;
        assert!(identity.public().verify(msg, &sig).is_err());
    }

    /// Announce validation without a ratchet, fixed private key.
    #[test]
    fn announce_validation_without_ratchet() {
        let mut key_bytes = [0u8; PRIVATE_KEY_LEN];
        for (i, b) in key_bytes.iter_mut().enumerate() {
            *b = (i + 1) as u8;
        }
        let identity = PrivateIdentity::from_private_bytes(&key_bytes).unwrap();

        let name_hash = NameHash::of("test.a");
        let random_hash = [0u8; 10]; // fixed for a reproducible test vector
        let app_data: &[u8] = b"";

        let destination_hash =
            Hash::of(&[name_hash.as_slice(), identity.hash().as_slice()].concat()).truncate16();
        let public_key = identity.public().to_public_bytes();

        let mut signed = Vec::new();
        signed.extend_from_slice(destination_hash.as_slice());
        signed.extend_from_slice(&public_key);
        signed.extend_from_slice(name_hash.as_slice());
        signed.extend_from_slice(&random_hash);
        signed.extend_from_slice(app_data);
        let signature = identity.sign(&signed);

        let mut payload = Vec::new();
        payload.extend_from_slice(&public_key);
        payload.extend_from_slice(name_hash.as_slice());
        payload.extend_from_slice(&random_hash);
        payload.extend_from_slice(&signature);
        payload.extend_from_slice(app_data);

        let info = validate_announce(&payload, false).expect("valid announce");
        assert_eq!(info.public_key, public_key);
        assert_eq!(info.destination_hash, destination_hash);

        let mut tampered = payload.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(validate_announce(&tampered, false).is_err());
    }
}
