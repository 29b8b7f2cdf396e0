use std::io;
use std::marker::PhantomData;

use crate::wire;
use crate::wire::Packet;

/// Size of the buffer sockets are read into.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Packet stream deserializer.
///
/// Turns a byte stream into packets, keeping partial packets across reads.
#[derive(Debug)]
pub struct Deserializer<D = Packet> {
    unparsed: Vec<u8>,
    item: PhantomData<D>,
}

impl<D: wire::Decode> Default for Deserializer<D> {
    fn default() -> Self {
        Self::new(READ_BUFFER_SIZE)
    }
}

impl<D: wire::Decode> Deserializer<D> {
    /// Create a new stream decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
            item: PhantomData,
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next item. Returns [`None`] if nothing was decoded.
    pub fn deserialize_next(&mut self) -> Result<Option<D>, wire::Error> {
        let mut reader = io::Cursor::new(self.unparsed.as_slice());

        match D::decode(&mut reader) {
            Ok(item) => {
                let pos = reader.position() as usize;
                self.unparsed.drain(..pos);

                Ok(Some(item))
            }
            Err(err) if err.is_eof() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Return whether there are unparsed bytes.
    pub fn is_empty(&self) -> bool {
        self.unparsed.is_empty()
    }

    /// Return the size of the unparsed data.
    pub fn len(&self) -> usize {
        self.unparsed.len()
    }
}

impl<D: wire::Decode> Iterator for Deserializer<D> {
    type Item = Result<D, wire::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.deserialize_next().transpose()
    }
}

#[cfg(test)]
mod test {
    use qcheck_macros::quickcheck;

    use super::*;
    use relay::assert_matches;

    #[test]
    fn test_decode_next() {
        let mut decoder = Deserializer::<Packet>::new(8);

        decoder.input(&[0, 0, 0, 3, b'b']);
        assert_matches!(decoder.deserialize_next(), Ok(None));
        assert_eq!(decoder.len(), 5);

        decoder.input(&[b'y']);
        assert_matches!(decoder.deserialize_next(), Ok(None));

        decoder.input(&[b'e', 0, 0]);
        assert_matches!(decoder.deserialize_next(), Ok(Some(p)) if p.body() == b"bye");
        assert_eq!(decoder.len(), 2);
        assert_matches!(decoder.deserialize_next(), Ok(None));
    }

    #[test]
    fn test_oversized_prefix() {
        let mut decoder = Deserializer::<Packet>::default();

        decoder.input(&[0xff, 0xff, 0xff, 0xff]);
        assert_matches!(
            decoder.deserialize_next(),
            Err(wire::Error::InvalidSize { .. })
        );
    }

    #[quickcheck]
    fn prop_decode_any_chunking(bodies: Vec<Vec<u8>>, chunk_size: usize) {
        let packets = bodies
            .iter()
            .map(|body| Packet::new(body).unwrap())
            .collect::<Vec<_>>();
        let stream = packets
            .iter()
            .flat_map(|p| p.as_bytes().to_vec())
            .collect::<Vec<_>>();
        let mut decoder = Deserializer::<Packet>::new(8);
        let mut decoded = Vec::new();

        for chunk in stream.chunks(1 + chunk_size % 64) {
            decoder.input(chunk);

            for packet in decoder.by_ref() {
                decoded.push(packet.unwrap());
            }
        }
        assert!(decoder.is_empty());
        assert_eq!(decoded, packets);
    }
}
