//! SHA-256 and the truncated forms used as on-wire addresses: a full 32-byte
//! `Hash` plus a 16-byte `AddressHash` truncation, both backed by one
//! SHA-256 call.

use core::fmt;

use alloc::string::String;
use sha2::{Digest, Sha256};

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_HASH_SIZE: usize = 16;
pub const NAME_HASH_SIZE: usize = 10;

/// Full 32-byte SHA-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; HASH_SIZE]);

/// 16-byte truncation of a SHA-256 digest; the on-wire address unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressHash([u8; ADDRESS_HASH_SIZE]);

/// 10-byte truncation used only for the name-hash component of a destination
/// hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameHash([u8; NAME_HASH_SIZE]);

impl Hash {
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn truncate16(&self) -> AddressHash {
        let mut out = [0u8; ADDRESS_HASH_SIZE];
        out.copy_from_slice(&self.0[..ADDRESS_HASH_SIZE]);
        AddressHash(out)
    }
}

impl AddressHash {
    pub const fn from_bytes(bytes: [u8; ADDRESS_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; ADDRESS_HASH_SIZE])
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() != ADDRESS_HASH_SIZE {
            return None;
        }
        let mut out = [0u8; ADDRESS_HASH_SIZE];
        out.copy_from_slice(data);
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_HASH_SIZE] {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex_string(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex_string(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        Self::from_slice(&bytes)
    }
}

impl NameHash {
    /// `name_hash = sha256(utf8(app_name + "." + aspects.join(".")))[..10]`
    pub fn of(name_hash_input: &str) -> Self {
        let digest = Sha256::digest(name_hash_input.as_bytes());
        let mut out = [0u8; NAME_HASH_SIZE];
        out.copy_from_slice(&digest[..NAME_HASH_SIZE]);
        Self(out)
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() != NAME_HASH_SIZE {
            return None;
        }
        let mut out = [0u8; NAME_HASH_SIZE];
        out.copy_from_slice(data);
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; NAME_HASH_SIZE] {
        &self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Hash> for AddressHash {
    fn from(hash: Hash) -> Self {
        hash.truncate16()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SHA-256 truncated hash of the literal string "reticulum".
    #[test]
    fn truncated_hash_matches_precomputed_vector() {
        let full = Hash::of(b"reticulum");
        let truncated = full.truncate16();
        // sha256("reticulum") = eac4d70bfb1c16e45e39485e31e1f5cc...
        assert_eq!(truncated.to_hex_string(), "eac4d70bfb1c16e45e39485e31e1f5cc");
    }

    #[test]
    fn address_hash_hex_roundtrip() {
        let original = AddressHash::from_bytes([7u8; 16]);
        let hex = original.to_hex_string();
        let parsed = AddressHash::from_hex_string(&hex).unwrap();
        assert_eq!(original, parsed);
    }
}
