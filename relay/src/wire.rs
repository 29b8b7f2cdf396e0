//! Binary encoding of relay payloads.
//!
//! All integers are big-endian. Strings carry a `u16` length prefix, byte blobs
//! a `u32` length prefix and lists a `u16` item count.
pub mod packet;

use std::string::FromUtf8Error;
use std::{io, mem};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use crate::node::timestamp::Timestamp;

pub use packet::Packet;

/// The type we use to represent string lengths and list counts on the wire.
pub type Size = u16;

/// Upper bound for a single length-prefixed byte blob.
pub const MAX_BLOB_SIZE: usize = packet::MAX_PACKET_SIZE;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("UTF-8 error: {0}")]
    FromUtf8(#[from] FromUtf8Error),
    #[error("invalid size: maximum {max}, got {actual}")]
    InvalidSize { max: usize, actual: usize },
    #[error("unknown command `{0}`")]
    UnknownCommand(u16),
    #[error("unknown identity state `{0}`")]
    UnknownIdentityState(u8),
    #[error("unsupported envelope version `{0}`")]
    UnsupportedVersion(u8),
    #[error("{0} trailing byte(s) after payload")]
    TrailingBytes(usize),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(u64),
}

impl Error {
    /// Whether we've reached the end of file. This will be true when we fail to decode
    /// a value because there's not enough data in the stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Things that can be encoded as binary.
pub trait Encode {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Things that can be decoded from binary.
pub trait Decode: Sized {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;
}

/// Encode an object into a vector.
///
/// Panics if `data` exceeds one of its length prefixes. Use [`Encode`] directly
/// for values whose size isn't already bounded.
pub fn serialize<T: Encode + ?Sized>(data: &T) -> Vec<u8> {
    let mut buffer = Vec::new();
    let len = data
        .encode(&mut buffer)
        .expect("in-memory writes don't error");

    debug_assert_eq!(len, buffer.len());

    buffer
}

/// Decode an object from a byte slice. Fails if the object doesn't use up the
/// whole input.
pub fn deserialize<T: Decode>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = io::Cursor::new(data);
    let value = T::decode(&mut cursor)?;
    let rest = data.len() - cursor.position() as usize;

    if rest > 0 {
        return Err(Error::TrailingBytes(rest));
    }
    Ok(value)
}

/// Encode a `u32` length-prefixed byte blob.
pub fn encode_blob<W: io::Write + ?Sized>(
    bytes: &[u8],
    writer: &mut W,
) -> Result<usize, io::Error> {
    let len = u32::try_from(bytes.len())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let n = len.encode(writer)?;

    writer.write_all(bytes)?;

    Ok(n + bytes.len())
}

/// Decode a `u32` length-prefixed byte blob.
pub fn decode_blob<R: io::Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, Error> {
    let len = u32::decode(reader)? as usize;
    if len > MAX_BLOB_SIZE {
        return Err(Error::InvalidSize {
            max: MAX_BLOB_SIZE,
            actual: len,
        });
    }
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes)?;

    Ok(bytes)
}

impl Encode for u8 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u8(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u16 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u16::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u32 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u32::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u64 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u64::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl<T> Encode for &[T]
where
    T: Encode,
{
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let len = Size::try_from(self.len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut n = len.encode(writer)?;

        for item in self.iter() {
            n += item.encode(writer)?;
        }
        Ok(n)
    }
}

impl<T> Encode for Vec<T>
where
    T: Encode,
{
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_slice().encode(writer)
    }
}

impl Encode for &str {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let len = Size::try_from(self.len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let n = len.encode(writer)?;
        let bytes = self.as_bytes();

        // Nb. Don't use the [`Encode`] instance here for &[u8], because we are prefixing the
        // length ourselves.
        writer.write_all(bytes)?;

        Ok(n + bytes.len())
    }
}

impl Encode for str {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (&self).encode(writer)
    }
}

impl Encode for String {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(writer)
    }
}

impl Encode for Timestamp {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (**self).encode(writer)
    }
}

////////////////////////////////////////////////////////////////////////////////

impl Decode for u8 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u8().map_err(Error::from)
    }
}

impl Decode for u16 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u16::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for u32 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u32::<NetworkEndian>().map_err(Error::from)
    }
}

impl Decode for u64 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        reader.read_u64::<NetworkEndian>().map_err(Error::from)
    }
}

impl<T> Decode for Vec<T>
where
    T: Decode,
{
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len: Size = Size::decode(reader)?;
        // Don't trust the count for the allocation; items may be truncated.
        let mut vec = Vec::with_capacity((len as usize).min(64));

        for _ in 0..len {
            let item = T::decode(reader)?;
            vec.push(item);
        }
        Ok(vec)
    }
}

impl Decode for String {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)?;
        let mut bytes = vec![0; len as usize];

        reader.read_exact(&mut bytes)?;

        let string = String::from_utf8(bytes)?;

        Ok(string)
    }
}

impl Decode for Timestamp {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let millis = u64::decode(reader)?;
        if millis > *Timestamp::MAX {
            return Err(Error::InvalidTimestamp(millis));
        }
        Ok(Self::from(millis))
    }
}

#[cfg(test)]
mod test {
    use qcheck_macros::quickcheck;

    use super::*;
    use crate::assert_matches;

    #[test]
    fn test_string_encoding() {
        let bytes = serialize("bye");

        assert_eq!(bytes, vec![0, 3, b'b', b'y', b'e']);
        assert_eq!(deserialize::<String>(&bytes).unwrap(), "bye");
    }

    #[test]
    fn test_trailing_bytes() {
        assert_matches!(
            deserialize::<String>(&[0, 1, b'a', b'b']),
            Err(Error::TrailingBytes(1))
        );
    }

    #[test]
    fn test_truncated_is_eof() {
        let err = deserialize::<String>(&[0, 5, b'a']).unwrap_err();
        assert!(err.is_eof());

        let err = deserialize::<Vec<u32>>(&[0, 2, 0, 0, 0, 1]).unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn test_blob_too_large() {
        let mut bytes = Vec::new();
        ((MAX_BLOB_SIZE + 1) as u32).encode(&mut bytes).unwrap();

        assert_matches!(
            decode_blob(&mut bytes.as_slice()),
            Err(Error::InvalidSize { .. })
        );
    }

    #[test]
    fn test_timestamp_out_of_range() {
        assert_eq!(
            deserialize::<Timestamp>(&serialize(&*Timestamp::MAX)).unwrap(),
            Timestamp::MAX
        );
        assert_matches!(
            deserialize::<Timestamp>(&serialize(&u64::MAX)),
            Err(Error::InvalidTimestamp(u64::MAX))
        );
    }

    #[test]
    fn test_invalid_utf8() {
        assert_matches!(
            deserialize::<String>(&[0, 2, 0xff, 0xfe]),
            Err(Error::FromUtf8(_))
        );
    }

    #[quickcheck]
    fn prop_decode_never_panics(bytes: Vec<u8>) {
        deserialize::<Vec<String>>(&bytes).ok();
        decode_blob(&mut bytes.as_slice()).ok();
    }

    #[quickcheck]
    fn prop_string_list(items: Vec<String>) -> bool {
        let items = items.into_iter().take(16).collect::<Vec<_>>();

        deserialize::<Vec<String>>(&serialize(&items)).unwrap() == items
    }
}
