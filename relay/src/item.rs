//! Items stored and relayed by nodes.
use std::io;

use serde::{Deserialize, Serialize};

use crate::hash;
use crate::node::timestamp::Timestamp;
use crate::wire::{self, Decode, Encode};

/// Longest sender key id accepted. The upload acknowledgement repeats it twice
/// in a single string.
pub const MAX_SENDER_KEY_ID_LEN: usize = wire::Size::MAX as usize / 2;

/// An identity id: the hex-encoded hash prefix of the identity's public key.
pub type IdentityId = String;

/// Whether an identity is known.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdentityState {
    #[default]
    NonExistent = 0,
    Valid = 1,
}

impl TryFrom<u8> for IdentityState {
    type Error = wire::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NonExistent),
            1 => Ok(Self::Valid),
            other => Err(wire::Error::UnknownIdentityState(other)),
        }
    }
}

/// A published identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: IdentityId,
    pub public_key: Vec<u8>,
    pub last_seen: Timestamp,
    pub state: IdentityState,
}

impl Identity {
    /// Create a valid identity for the given key, deriving its id.
    pub fn new(public_key: Vec<u8>, last_seen: Timestamp) -> Self {
        Self {
            id: hash::identity_id(&public_key),
            public_key,
            last_seen,
            state: IdentityState::Valid,
        }
    }

    /// The placeholder returned when an identity isn't known.
    pub fn unknown(id: impl Into<IdentityId>) -> Self {
        Self {
            id: id.into(),
            public_key: Vec::new(),
            last_seen: Timestamp::EPOCH,
            state: IdentityState::NonExistent,
        }
    }

    /// Whether the id is bound to the public key.
    pub fn is_bound(&self) -> bool {
        self.id == hash::identity_id(&self.public_key)
    }
}

/// An encrypted message for a recipient.
///
/// On upload, `id` is the recipient's id. Once stored, the message is keyed
/// by its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_key_id: String,
    pub payload: Vec<u8>,
    /// Local delivery flag. Not part of the wire encoding.
    #[serde(skip)]
    pub is_downloaded: bool,
}

impl Message {
    pub fn new(
        recipient: impl Into<String>,
        sender_key_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: recipient.into(),
            sender_key_id: sender_key_id.into(),
            payload,
            is_downloaded: false,
        }
    }

    /// Content hash of the payload, used as the storage key.
    pub fn hash(&self) -> String {
        hash::content_hash(&self.payload)
    }

    /// Size of the wire encoding.
    pub fn encoded_len(&self) -> usize {
        2 + self.id.len() + 2 + self.sender_key_id.len() + 4 + self.payload.len()
    }
}

/// A recipient's request that a message be sent again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendRequest {
    /// Id of the message to resend.
    pub id: String,
    pub recipient_id: String,
}

impl ResendRequest {
    pub fn new(id: impl Into<String>, recipient_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            recipient_id: recipient_id.into(),
        }
    }
}

/// A group of identities, owned by a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub public_key: Vec<u8>,
    pub members: Vec<IdentityId>,
    pub modified_at: Timestamp,
}

/// Answer to a resend status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResendStatus {
    /// Neither the message nor a resend request are known.
    Untraceable = 0,
    /// The message is still stored.
    Pending = 1,
    /// Only a resend request is stored.
    ResendRequired = 2,
}

impl From<ResendStatus> for u8 {
    fn from(status: ResendStatus) -> Self {
        status as u8
    }
}

impl Encode for Identity {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.id.encode(writer)?;
        n += wire::encode_blob(&self.public_key, writer)?;
        n += self.last_seen.encode(writer)?;
        n += (self.state as u8).encode(writer)?;

        Ok(n)
    }
}

impl Decode for Identity {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let id = String::decode(reader)?;
        let public_key = wire::decode_blob(reader)?;
        let last_seen = Timestamp::decode(reader)?;
        let state = IdentityState::try_from(u8::decode(reader)?)?;

        Ok(Self {
            id,
            public_key,
            last_seen,
            state,
        })
    }
}

impl Encode for Message {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.id.encode(writer)?;
        n += self.sender_key_id.encode(writer)?;
        n += wire::encode_blob(&self.payload, writer)?;

        Ok(n)
    }
}

impl Decode for Message {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let id = String::decode(reader)?;
        let sender_key_id = String::decode(reader)?;
        if sender_key_id.len() > MAX_SENDER_KEY_ID_LEN {
            return Err(wire::Error::InvalidSize {
                max: MAX_SENDER_KEY_ID_LEN,
                actual: sender_key_id.len(),
            });
        }
        let payload = wire::decode_blob(reader)?;

        Ok(Self {
            id,
            sender_key_id,
            payload,
            is_downloaded: false,
        })
    }
}

impl Encode for ResendRequest {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.id.encode(writer)?;
        n += self.recipient_id.encode(writer)?;

        Ok(n)
    }
}

impl Decode for ResendRequest {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let id = String::decode(reader)?;
        let recipient_id = String::decode(reader)?;

        Ok(Self { id, recipient_id })
    }
}

impl Encode for Group {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = self.id.encode(writer)?;
        n += wire::encode_blob(&self.public_key, writer)?;
        n += self.members.encode(writer)?;
        n += self.modified_at.encode(writer)?;

        Ok(n)
    }
}

impl Decode for Group {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let id = String::decode(reader)?;
        let public_key = wire::decode_blob(reader)?;
        let members = Vec::<String>::decode(reader)?;
        let modified_at = Timestamp::decode(reader)?;

        Ok(Self {
            id,
            public_key,
            members,
            modified_at,
        })
    }
}
