//! Peer record store.
//!
//! Known relay candidates and their connection history.
use std::net;

use sqlite as sql;
use thiserror::Error;

use crate::node::{self, Database, Timestamp};
use crate::sql::transaction;

#[derive(Error, Debug)]
pub enum Error {
    /// An Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    #[error("invalid peer address `{0}`")]
    InvalidAddress(String),
}

/// A known relay peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Peer id, the canonical `address:port` string.
    pub id: String,
    pub address: net::IpAddr,
    pub port: u16,
    /// Last time the peer was advertised or successfully connected to.
    pub last_seen: Timestamp,
    /// Last time connecting failed through the peer's fault.
    pub last_error: Option<Timestamp>,
    /// Number of failures attributed to the peer.
    pub error_score: u32,
}

impl PeerRecord {
    pub fn new(addr: net::SocketAddr, last_seen: Timestamp) -> Self {
        let addr = node::canonical(addr);

        Self {
            id: node::peer_id(&addr),
            address: addr.ip(),
            port: addr.port(),
            last_seen,
            last_error: None,
            error_score: 0,
        }
    }

    /// Socket address of the peer.
    pub fn addr(&self) -> net::SocketAddr {
        net::SocketAddr::new(self.address, self.port)
    }
}

/// Peer store.
pub trait Store {
    /// Get a peer.
    fn get(&self, id: &str) -> Result<Option<PeerRecord>, Error>;
    /// Insert a peer, or refresh its last seen time if already known.
    ///
    /// Returns `true` if the peer wasn't known.
    fn insert(&mut self, addr: net::SocketAddr, seen: Timestamp) -> Result<bool, Error>;
    /// Get all peers.
    fn entries(&self) -> Result<Vec<PeerRecord>, Error>;
    /// Number of known peers.
    fn len(&self) -> Result<usize, Error>;
    /// Returns true if there are no peers.
    fn is_empty(&self) -> Result<bool, Error> {
        self.len().map(|l| l == 0)
    }
    /// Mark a peer as successfully connected at a certain time.
    fn connected(&mut self, id: &str, time: Timestamp) -> Result<(), Error>;
    /// Record a failure attributed to a peer.
    fn record_error(&mut self, id: &str, time: Timestamp) -> Result<(), Error>;
}

impl Store for Database {
    fn get(&self, id: &str) -> Result<Option<PeerRecord>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, address, port, last_seen, last_error, error_score FROM peers WHERE id = ?1",
        )?;
        stmt.bind((1, id))?;

        match stmt.into_iter().next() {
            Some(row) => Ok(Some(parse::record(&row?)?)),
            None => Ok(None),
        }
    }

    fn insert(&mut self, addr: net::SocketAddr, seen: Timestamp) -> Result<bool, Error> {
        let record = PeerRecord::new(addr, seen);

        transaction(&self.db, |db| {
            let known = {
                let mut stmt = db.prepare("SELECT 1 FROM peers WHERE id = ?1")?;
                stmt.bind((1, record.id.as_str()))?;
                stmt.into_iter().next().transpose()?.is_some()
            };
            let mut stmt = db.prepare(
                "INSERT INTO peers (id, address, port, last_seen)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT DO UPDATE
                 SET last_seen = ?4
                 WHERE last_seen < ?4",
            )?;
            stmt.bind((1, record.id.as_str()))?;
            stmt.bind((2, record.address.to_string().as_str()))?;
            stmt.bind((3, record.port as i64))?;
            stmt.bind((4, seen))?;
            stmt.next()?;

            Ok::<_, Error>(!known)
        })
    }

    fn entries(&self) -> Result<Vec<PeerRecord>, Error> {
        let stmt = self.db.prepare(
            "SELECT id, address, port, last_seen, last_error, error_score FROM peers ORDER BY id",
        )?;
        let mut entries = Vec::new();

        for row in stmt.into_iter() {
            entries.push(parse::record(&row?)?);
        }
        Ok(entries)
    }

    fn len(&self) -> Result<usize, Error> {
        crate::sql::count(&self.db, "SELECT COUNT(*) FROM peers", []).map_err(Error::from)
    }

    fn connected(&mut self, id: &str, time: Timestamp) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("UPDATE peers SET last_seen = ?1 WHERE id = ?2 AND last_seen < ?1")?;

        stmt.bind((1, time))?;
        stmt.bind((2, id))?;
        stmt.next()?;

        Ok(())
    }

    fn record_error(&mut self, id: &str, time: Timestamp) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "UPDATE peers
             SET last_error = ?1, error_score = error_score + 1
             WHERE id = ?2",
        )?;

        stmt.bind((1, time))?;
        stmt.bind((2, id))?;
        stmt.next()?;

        Ok(())
    }
}

mod parse {
    use super::*;

    pub fn record(row: &sql::Row) -> Result<PeerRecord, Error> {
        let address = row.read::<&str, _>("address");
        let address = address
            .parse::<net::IpAddr>()
            .map_err(|_| Error::InvalidAddress(address.to_owned()))?;
        let port = row.read::<i64, _>("port");
        let port = u16::try_from(port).map_err(|_| Error::InvalidAddress(port.to_string()))?;

        Ok(PeerRecord {
            id: row.read::<&str, _>("id").to_owned(),
            address,
            port,
            last_seen: row.read::<Timestamp, _>("last_seen"),
            last_error: row
                .read::<Option<i64>, _>("last_error")
                .map(|t| Timestamp::from(t.max(0) as u64)),
            error_score: row.read::<i64, _>("error_score").clamp(0, u32::MAX as i64) as u32,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> net::SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.db");
        let db = Database::open(path).unwrap();

        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn test_insert_and_get() {
        let mut db = Database::memory().unwrap();
        let a = addr("10.0.0.1:38334");

        assert!(db.insert(a, Timestamp::from(1)).unwrap());
        assert!(!db.insert(a, Timestamp::from(2)).unwrap());
        // Stale sightings don't move the clock back.
        assert!(!db.insert(a, Timestamp::from(1)).unwrap());

        let record = db.get("10.0.0.1:38334").unwrap().unwrap();
        assert_eq!(record.addr(), a);
        assert_eq!(record.last_seen, Timestamp::from(2));
        assert_eq!(record.last_error, None);
        assert_eq!(db.get("10.0.0.2:38334").unwrap(), None);
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn test_mapped_addresses_are_one_peer() {
        let mut db = Database::memory().unwrap();

        db.insert(addr("10.0.0.1:38334"), Timestamp::from(1)).unwrap();
        db.insert(addr("[::ffff:10.0.0.1]:38334"), Timestamp::from(1))
            .unwrap();

        assert_eq!(db.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_record_error_and_connected() {
        let mut db = Database::memory().unwrap();
        let a = addr("[2001:db8::1]:38334");
        let id = node::peer_id(&a);

        db.insert(a, Timestamp::from(1)).unwrap();
        db.record_error(&id, Timestamp::from(5)).unwrap();
        db.record_error(&id, Timestamp::from(7)).unwrap();
        db.connected(&id, Timestamp::from(9)).unwrap();

        let record = db.get(&id).unwrap().unwrap();
        assert_eq!(record.last_error, Some(Timestamp::from(7)));
        assert_eq!(record.error_score, 2);
        assert_eq!(record.last_seen, Timestamp::from(9));
        assert_eq!(record.addr(), a);
    }
}
