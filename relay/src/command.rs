//! Request and response commands.
//!
//! A command is a `u16` id followed by the payload, which extends to the end of
//! the envelope.
use std::{fmt, io};

use crate::wire::{self, Decode, Encode};

/// Command identifier.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    AnyNews = 10,
    AnyNewsResponse = 11,
    CheckForResendRequest = 12,
    CheckForResendRequestResponse = 13,
    DownloadMessages = 14,
    DownloadMessagesResponse = 15,
    UploadMessage = 16,
    UploadMessageResponse = 17,
    UploadResendRequest = 18,
    UploadResendRequestResponse = 19,
    GetIdentity = 20,
    GetIdentityResponse = 21,
    PublishIdentity = 22,
    PublishIdentityResponse = 23,
    GetGroup = 24,
    GetGroupResponse = 25,
    PublishGroup = 26,
    PublishGroupResponse = 27,
    Balance = 30,
    BalanceResponse = 31,
    Outputs = 32,
    OutputsResponse = 33,
    ServerException = 255,
}

impl CommandId {
    /// The response matching a request, if this is a request.
    pub fn response(self) -> Option<CommandId> {
        match self {
            Self::AnyNews => Some(Self::AnyNewsResponse),
            Self::CheckForResendRequest => Some(Self::CheckForResendRequestResponse),
            Self::DownloadMessages => Some(Self::DownloadMessagesResponse),
            Self::UploadMessage => Some(Self::UploadMessageResponse),
            Self::UploadResendRequest => Some(Self::UploadResendRequestResponse),
            Self::GetIdentity => Some(Self::GetIdentityResponse),
            Self::PublishIdentity => Some(Self::PublishIdentityResponse),
            Self::GetGroup => Some(Self::GetGroupResponse),
            Self::PublishGroup => Some(Self::PublishGroupResponse),
            Self::Balance => Some(Self::BalanceResponse),
            Self::Outputs => Some(Self::OutputsResponse),
            _ => None,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", *self as u16)
    }
}

impl From<CommandId> for u16 {
    fn from(other: CommandId) -> Self {
        other as u16
    }
}

impl TryFrom<u16> for CommandId {
    type Error = u16;

    fn try_from(other: u16) -> Result<Self, Self::Error> {
        match other {
            10 => Ok(Self::AnyNews),
            11 => Ok(Self::AnyNewsResponse),
            12 => Ok(Self::CheckForResendRequest),
            13 => Ok(Self::CheckForResendRequestResponse),
            14 => Ok(Self::DownloadMessages),
            15 => Ok(Self::DownloadMessagesResponse),
            16 => Ok(Self::UploadMessage),
            17 => Ok(Self::UploadMessageResponse),
            18 => Ok(Self::UploadResendRequest),
            19 => Ok(Self::UploadResendRequestResponse),
            20 => Ok(Self::GetIdentity),
            21 => Ok(Self::GetIdentityResponse),
            22 => Ok(Self::PublishIdentity),
            23 => Ok(Self::PublishIdentityResponse),
            24 => Ok(Self::GetGroup),
            25 => Ok(Self::GetGroupResponse),
            26 => Ok(Self::PublishGroup),
            27 => Ok(Self::PublishGroupResponse),
            30 => Ok(Self::Balance),
            31 => Ok(Self::BalanceResponse),
            32 => Ok(Self::Outputs),
            33 => Ok(Self::OutputsResponse),
            255 => Ok(Self::ServerException),
            _ => Err(other),
        }
    }
}

/// A request or a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub payload: Vec<u8>,
}

impl Command {
    /// Create a command with an encoded payload.
    ///
    /// Fails if the payload can't be encoded, eg. a string longer than the
    /// length prefix allows.
    pub fn new<T: Encode + ?Sized>(id: CommandId, payload: &T) -> Result<Self, wire::Error> {
        let mut buffer = Vec::new();
        payload.encode(&mut buffer)?;

        Ok(Self {
            id,
            payload: buffer,
        })
    }

    /// Create a command with a raw payload.
    pub fn raw(id: CommandId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Error reply carrying a message.
    pub fn server_exception(text: &str) -> Self {
        // Stay within the string length limit.
        let mut end = text.len().min(wire::Size::MAX as usize);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        Self::raw(CommandId::ServerException, wire::serialize(&text[..end]))
    }

    /// Decode the payload as `T`, requiring it to be consumed entirely.
    pub fn decode_payload<T: Decode>(&self) -> Result<T, wire::Error> {
        wire::deserialize(&self.payload)
    }

    /// If this is an error reply, the error text.
    pub fn exception(&self) -> Option<String> {
        if self.id == CommandId::ServerException {
            Some(
                self.decode_payload::<String>()
                    .unwrap_or_else(|_| String::from_utf8_lossy(&self.payload).into_owned()),
            )
        } else {
            None
        }
    }
}

impl Encode for Command {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let n = u16::from(self.id).encode(writer)?;
        writer.write_all(&self.payload)?;

        Ok(n + self.payload.len())
    }
}

impl Decode for Command {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let id = u16::decode(reader)?;
        let id = CommandId::try_from(id).map_err(wire::Error::UnknownCommand)?;
        let mut payload = Vec::new();

        reader.read_to_end(&mut payload)?;

        Ok(Self { id, payload })
    }
}
