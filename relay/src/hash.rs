use std::fmt;

use sha2::{Digest as _, Sha256};

/// Number of digest bytes that make up an identity id.
pub const IDENTITY_ID_LEN: usize = 10;

/// A SHA-256 hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Hex-encoded prefix of the digest, of the given byte length.
    pub fn to_hex_prefix(&self, len: usize) -> String {
        self.0[..len.min(self.0.len())]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Derive the identity id bound to a public key.
///
/// An identity is only ever accepted under this id, which makes it impossible
/// to publish a key under somebody else's id.
pub fn identity_id(public_key: &[u8]) -> String {
    Digest::new(public_key).to_hex_prefix(IDENTITY_ID_LEN)
}

/// Content hash of a message payload. Byte-identical payloads always map to
/// the same hash, which is what de-duplicates re-submitted messages.
pub fn content_hash(payload: &[u8]) -> String {
    Digest::new(payload).to_string()
}
