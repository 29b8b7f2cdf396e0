//! Balance and output queries, answered by the host's address index.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("balance queries are not available on this node")]
    Unavailable,
    #[error("invalid query `{0}`, expected `address;flags`")]
    InvalidQuery(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// A balance query: an address and lookup flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<'a> {
    pub address: &'a str,
    pub flags: i32,
}

impl<'a> Query<'a> {
    /// Parse an `address;flags` query.
    pub fn parse(query: &'a str) -> Result<Self, Error> {
        let invalid = || Error::InvalidQuery(query.to_owned());
        let mut parts = query.split(';');

        match (parts.next(), parts.next(), parts.next()) {
            (Some(address), Some(flags), None) => Ok(Self {
                address,
                flags: flags.trim().parse().map_err(|_| invalid())?,
            }),
            _ => Err(invalid()),
        }
    }
}

/// Balance collaborator. Responses are passed to clients verbatim.
pub trait Balances: Send + Sync {
    /// Balance of an address.
    fn balance(&self, query: &Query) -> Result<Vec<u8>, Error>;
    /// Spendable outputs of an address.
    fn outputs(&self, query: &Query) -> Result<Vec<u8>, Error>;
}

/// Used when the node runs without an address index.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl Balances for Unavailable {
    fn balance(&self, _query: &Query) -> Result<Vec<u8>, Error> {
        Err(Error::Unavailable)
    }

    fn outputs(&self, _query: &Query) -> Result<Vec<u8>, Error> {
        Err(Error::Unavailable)
    }
}
