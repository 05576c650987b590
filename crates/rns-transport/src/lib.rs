//! Router, link state machine, and resource transfer for a
//! Reticulum-compatible mesh, built on top of `rns_core`'s wire format and
//! cryptographic identity layer.

pub mod announce_queue;
pub mod channel;
pub mod config;
pub mod dedup;
pub mod error;
pub mod iface;
pub mod link;
pub mod path_table;
pub mod process;
pub mod receipt;
pub mod resource;
pub mod transport;

pub use config::TransportConfig;
pub use error::{LifecycleError, LinkError, ProtocolError, ResourceError, TimeoutError, TransportError};
pub use transport::Transport;

use hkdf::Hkdf;
use sha2::Sha256;

/// `HKDF-SHA256(salt = link_id, ikm = shared_secret)`, expanded to 64 bytes,
/// used for the link's data-encryption `Token` key. Mirrors
/// `rns_core::identity`'s private `derive_token_key`, duplicated here
/// because link keys are salted by `link_id` rather than an identity hash.
pub(crate) fn derive_link_key(shared_secret: &[u8], salt: &[u8]) -> [u8; 64] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut out = [0u8; 64];
    hk.expand(&[], &mut out).expect("64 bytes is within HKDF-SHA256's output limit");
    out
}
