//! Envelope framing.
//!
//! Packet bodies are envelopes, which may authenticate or encrypt the payload.
//! Implementations are shared by every inbound socket and outbound connection,
//! hence they must be safe to call concurrently.
use thiserror::Error;

/// Envelope version understood by [`Plaintext`].
pub const PLAINTEXT_VERSION: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("empty envelope")]
    Empty,
    #[error("unsupported envelope version `{0}`")]
    UnsupportedVersion(u8),
}

/// An unwrapped envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub payload: Vec<u8>,
    /// Whether the sender was authenticated.
    pub authenticated: bool,
    /// The authenticated user, if any.
    pub user: Option<String>,
}

/// Wraps and unwraps envelopes.
pub trait Framing: Send + Sync {
    /// Unwrap a received envelope.
    fn unwrap(&self, envelope: &[u8]) -> Result<Unwrapped, Error>;
    /// Wrap a payload for sending.
    fn wrap(&self, payload: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Unencrypted, unauthenticated envelopes: a version byte followed by the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

impl Framing for Plaintext {
    fn unwrap(&self, envelope: &[u8]) -> Result<Unwrapped, Error> {
        match envelope.split_first() {
            Some((&PLAINTEXT_VERSION, payload)) => Ok(Unwrapped {
                payload: payload.to_vec(),
                authenticated: false,
                user: None,
            }),
            Some((&version, _)) => Err(Error::UnsupportedVersion(version)),
            None => Err(Error::Empty),
        }
    }

    fn wrap(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let mut envelope = Vec::with_capacity(payload.len() + 1);
        envelope.push(PLAINTEXT_VERSION);
        envelope.extend_from_slice(payload);

        Ok(envelope)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_plaintext() {
        let envelope = Plaintext.wrap(b"hi").unwrap();

        assert_eq!(envelope, vec![PLAINTEXT_VERSION, b'h', b'i']);
        assert_eq!(Plaintext.unwrap(&envelope).unwrap().payload, b"hi");
        assert_eq!(Plaintext.unwrap(&[]), Err(Error::Empty));
        assert_eq!(Plaintext.unwrap(&[7, 0]), Err(Error::UnsupportedVersion(7)));
    }
}
