//! The `Token` authenticated-encryption construction.
//!
//! `token = IV(16) || AES-256-CBC(enc_key, IV, PKCS#7(plaintext)) ||
//! HMAC-SHA-256(hmac_key, IV || ciphertext)`
//!
//! No version/timestamp prefix; the 64-byte derived key splits as
//! `enc_key || hmac_key` rather than two separately-sized AES/HMAC keys.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use alloc::vec::Vec;
use hmac::{Hmac, Mac};
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;

use crate::error::CryptoError;

type AesCbcEnc = cbc::Encryptor<aes::Aes256>;
type AesCbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const IV_SIZE: usize = 16;
pub const HMAC_SIZE: usize = 32;
pub const KEY_SIZE: usize = 64;
pub const ENC_KEY_SIZE: usize = 32;
pub const HMAC_KEY_SIZE: usize = 32;
pub const OVERHEAD: usize = IV_SIZE + HMAC_SIZE;
/// Smallest possible valid token: IV + one PKCS#7 block (even empty
/// plaintext pads to a full block) + HMAC tag.
pub const MIN_TOKEN_SIZE: usize = IV_SIZE + 16 + HMAC_SIZE;

/// A 64-byte key, split `enc_key = K[0..32]`, `hmac_key = K[32..64]`.
pub struct Token {
    enc_key: [u8; ENC_KEY_SIZE],
    hmac_key: [u8; HMAC_KEY_SIZE],
}

impl Token {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        let mut enc_key = [0u8; ENC_KEY_SIZE];
        let mut hmac_key = [0u8; HMAC_KEY_SIZE];
        enc_key.copy_from_slice(&key[..ENC_KEY_SIZE]);
        hmac_key.copy_from_slice(&key[ENC_KEY_SIZE..]);
        Self { enc_key, hmac_key }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| CryptoError::BufferTooSmall)?;
        Ok(Self::new(&key))
    }

    pub fn encrypt<R: RngCore + CryptoRng>(&self, rng: &mut R, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_SIZE];
        rng.fill_bytes(&mut iv);

        let block_size = 16usize;
        let padded_len = (plaintext.len() / block_size + 1) * block_size;
        let mut out = Vec::with_capacity(IV_SIZE + padded_len + HMAC_SIZE);
        out.extend_from_slice(&iv);

        let mut buf = alloc::vec![0u8; padded_len];
        let ciphertext_len = AesCbcEnc::new(&self.enc_key.into(), &iv.into())
            .encrypt_padded_b2b_mut::<Pkcs7>(plaintext, &mut buf)
            .expect("buffer sized for worst-case PKCS#7 padding")
            .len();
        out.extend_from_slice(&buf[..ciphertext_len]);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hmac_key)
            .expect("HMAC accepts any key length");
        mac.update(&out);
        out.extend_from_slice(&mac.finalize().into_bytes());

        out
    }

    /// Verifies the HMAC in constant time before touching ciphertext, then
    /// decrypts. Fails closed: `Truncated` if too short, `Hmac` if the tag
    /// does not verify, `BadPadding` if PKCS#7 is invalid.
    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if token.len() < MIN_TOKEN_SIZE {
            return Err(CryptoError::Truncated);
        }

        let tag_start = token.len() - HMAC_SIZE;
        let (signed, tag) = token.split_at(tag_start);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hmac_key)
            .expect("HMAC accepts any key length");
        mac.update(signed);
        mac.verify_slice(tag).map_err(|_| CryptoError::Hmac)?;

        let iv: [u8; IV_SIZE] = token[..IV_SIZE].try_into().expect("checked length above");
        let ciphertext = &token[IV_SIZE..tag_start];

        let mut buf = ciphertext.to_vec();
        let plaintext_len = AesCbcDec::new(&self.enc_key.into(), &iv.into())
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| CryptoError::BadPadding)?
            .len();
        buf.truncate(plaintext_len);

        Ok(buf)
    }
}
