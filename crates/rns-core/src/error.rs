use thiserror::Error;

/// Crypto-primitive failures. Surfaced to the caller; ingress paths drop on
/// any of these rather than propagating.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("token shorter than IV + HMAC overhead")]
    Truncated,
    #[error("HMAC verification failed")]
    Hmac,
    #[error("PKCS#7 padding invalid")]
    BadPadding,
    #[error("ed25519 signature did not verify")]
    BadSignature,
    #[error("output buffer too small")]
    BufferTooSmall,
}

/// Packet codec failures. Never propagate out of the router: a `ParseError`
/// on ingress means drop the packet and count it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet shorter than the minimum header length")]
    TooShort,
    #[error("header fields are internally inconsistent")]
    BadHeader,
    #[error("unknown packet context byte: {0:#04x}")]
    UnknownContext(u8),
    #[error("payload failed to decode for its declared context")]
    BadPayload,
}

/// Identity-layer failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    #[error("operation requires private key material, but this identity is public-only")]
    PublicOnly,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("announce payload too short for a name_hash + random_hash + signature")]
    AnnounceTooShort,
    #[error("announce destination_hash did not match name_hash || identity_hash")]
    AnnounceDestinationMismatch,
    #[error("announce conflicts with a previously stored public key for this destination")]
    AnnounceKeyConflict,
}
