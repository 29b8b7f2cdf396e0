use std::io;

use super::{Decode, Encode, Error};

/// Maximum size of a packet body.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;
/// Size of the packet length prefix.
pub const PACKET_PREFIX_LEN: usize = 4;

/// A length-prefixed packet, as exchanged on stream and datagram sockets.
///
/// Holds the raw bytes, including the length prefix, so that packets can be
/// written back out without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl Packet {
    /// Create a packet carrying the given body.
    pub fn new(body: &[u8]) -> Result<Self, Error> {
        if body.len() > MAX_PACKET_SIZE {
            return Err(Error::InvalidSize {
                max: MAX_PACKET_SIZE,
                actual: body.len(),
            });
        }
        let mut raw = Vec::with_capacity(PACKET_PREFIX_LEN + body.len());
        raw.extend_from_slice(&(body.len() as u32).to_be_bytes());
        raw.extend_from_slice(body);

        Ok(Self(raw))
    }

    /// The packet body, without the length prefix.
    pub fn body(&self) -> &[u8] {
        &self.0[PACKET_PREFIX_LEN..]
    }

    /// The full packet, as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the packet, returning its body.
    pub fn into_body(mut self) -> Vec<u8> {
        self.0.drain(..PACKET_PREFIX_LEN);
        self.0
    }
}

impl Default for Packet {
    /// A packet with an empty body.
    fn default() -> Self {
        Self(vec![0; PACKET_PREFIX_LEN])
    }
}

impl Encode for Packet {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_all(&self.0)?;

        Ok(self.0.len())
    }
}

impl Decode for Packet {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = u32::decode(reader)? as usize;
        // Reject before waiting for the body, otherwise a bogus prefix would
        // have us buffer forever.
        if len > MAX_PACKET_SIZE {
            return Err(Error::InvalidSize {
                max: MAX_PACKET_SIZE,
                actual: len,
            });
        }
        let mut raw = vec![0; PACKET_PREFIX_LEN + len];
        raw[..PACKET_PREFIX_LEN].copy_from_slice(&(len as u32).to_be_bytes());
        reader.read_exact(&mut raw[PACKET_PREFIX_LEN..])?;

        Ok(Self(raw))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assert_matches;
    use crate::wire;

    #[test]
    fn test_packet_layout() {
        let packet = Packet::new(b"ping").unwrap();

        assert_eq!(packet.as_bytes(), &[0, 0, 0, 4, b'p', b'i', b'n', b'g']);
        assert_eq!(packet.body(), b"ping");
        assert_eq!(
            wire::deserialize::<Packet>(packet.as_bytes()).unwrap(),
            packet
        );
        assert_eq!(packet.into_body(), b"ping".to_vec());
    }

    #[test]
    fn test_packet_too_large() {
        let bytes = ((MAX_PACKET_SIZE + 1) as u32).to_be_bytes();

        assert_matches!(
            wire::deserialize::<Packet>(&bytes),
            Err(Error::InvalidSize { .. })
        );
        assert!(Packet::new(&vec![0; MAX_PACKET_SIZE + 1]).is_err());
    }

    #[test]
    fn test_partial_packet_is_eof() {
        let err = wire::deserialize::<Packet>(&[0, 0, 0, 8, 1, 2]).unwrap_err();
        assert!(err.is_eof());
    }
}
