//! Item store.
//!
//! Idempotent persistence of identities, messages, resend requests and groups.
//! Every `try_add_*` operation reports whether the item is new, which is what
//! decides whether it gets forwarded to other relays.
use std::time;

use localtime::LocalDuration;
use sqlite as sql;
use thiserror::Error;

use crate::item::{Group, Identity, IdentityState, Message, ResendRequest, ResendStatus};
use crate::node::{Database, Timestamp};
use crate::sql::{count, transaction};
use crate::wire::packet::MAX_PACKET_SIZE;

/// Maximum number of messages returned by a single download.
pub const DOWNLOAD_BATCH_SIZE: usize = 3;
/// Maximum encoded size of the messages returned by a single download. Leaves
/// room for the reply's command id, list count and framing envelope.
pub const DOWNLOAD_BATCH_BYTES: usize = MAX_PACKET_SIZE - 64;

const COUNTER_RECEIVED: &str = "messages_received";
const COUNTER_DELIVERED: &str = "messages_delivered";

#[derive(Error, Debug)]
pub enum Error {
    /// An Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    #[error("identity id `{0}` and public key are unrelated")]
    IdMismatch(String),
    #[error("different public key for identity `{0}`, ignoring request")]
    KeySubstitution(String),
    #[error("different public key for group `{0}`, ignoring request")]
    GroupKeySubstitution(String),
    #[error("invalid group members: {0}")]
    Members(#[from] serde_json::Error),
    #[error("message `{id}` for `{recipient}` is still stored, yet a resend request exists")]
    Invariant { id: String, recipient: String },
    #[error("message is too large: maximum {max} bytes, got {actual}")]
    MessageTooLarge { max: usize, actual: usize },
}

/// Store statistics. Computed on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStats {
    /// Number of identities.
    pub identities: usize,
    /// Number of messages waiting to be downloaded.
    pub messages: usize,
    /// Number of resend requests.
    pub resend_requests: usize,
    /// Messages received since the store was created.
    pub total_received: usize,
    /// Messages delivered since the store was created.
    pub total_delivered: usize,
    /// How long it took to compute these statistics.
    pub elapsed: LocalDuration,
}

/// Item store.
pub trait Store {
    /// Add or refresh an identity. Returns `true` if the identity wasn't known.
    fn try_add_identity(&mut self, identity: &Identity, now: Timestamp) -> Result<bool, Error>;
    /// Get an identity. Returns a [`IdentityState::NonExistent`] identity if unknown.
    fn get_identity(&self, id: &str) -> Result<Identity, Error>;
    /// Get all identities.
    fn identities(&self) -> Result<Vec<Identity>, Error>;
    /// Store a message for the recipient named by its `id`, keyed by content hash.
    /// Returns `true` if the message wasn't already stored.
    fn try_add_message(&mut self, message: &Message, now: Timestamp) -> Result<bool, Error>;
    /// Number of messages waiting to be downloaded by the recipient.
    fn any_news(&self, recipient: &str) -> Result<usize, Error>;
    /// Return the oldest undelivered messages of a recipient, and mark them as delivered.
    /// The batch is capped by [`DOWNLOAD_BATCH_SIZE`] and [`DOWNLOAD_BATCH_BYTES`], but
    /// always holds at least one message if any are pending.
    fn get_messages(&mut self, recipient: &str, now: Timestamp) -> Result<Vec<Message>, Error>;
    /// Store a resend request. Removes the referenced message if it was already delivered.
    /// Returns `true` if the request wasn't already stored.
    fn try_add_resend_request(
        &mut self,
        request: &ResendRequest,
        now: Timestamp,
    ) -> Result<bool, Error>;
    /// Status of a message, from the sender's point of view.
    fn check_resend(&self, query: &ResendRequest) -> Result<ResendStatus, Error>;
    /// Add or update a group. Returns `true` if the group was stored.
    fn try_add_group(&mut self, group: &Group) -> Result<bool, Error>;
    /// Get a group.
    fn get_group(&self, id: &str) -> Result<Option<Group>, Error>;
    /// Remove delivered messages that were delivered before the given time.
    fn prune_delivered(&mut self, before: Timestamp) -> Result<usize, Error>;
    /// Compute store statistics.
    fn stats(&self) -> Result<RepoStats, Error>;
}

impl Store for Database {
    fn try_add_identity(&mut self, identity: &Identity, now: Timestamp) -> Result<bool, Error> {
        if !identity.is_bound() {
            return Err(Error::IdMismatch(identity.id.clone()));
        }
        transaction(&self.db, |db| {
            let mut stmt = db.prepare("SELECT public_key FROM identities WHERE id = ?1")?;
            stmt.bind((1, identity.id.as_str()))?;

            if let Some(row) = stmt.into_iter().next() {
                let row = row?;
                if row.read::<&[u8], _>("public_key") != identity.public_key.as_slice() {
                    return Err(Error::KeySubstitution(identity.id.clone()));
                }
                let mut stmt = db.prepare("UPDATE identities SET last_seen = ?1 WHERE id = ?2")?;
                stmt.bind((1, now))?;
                stmt.bind((2, identity.id.as_str()))?;
                stmt.next()?;

                return Ok(false);
            }
            let mut stmt = db
                .prepare("INSERT INTO identities (id, public_key, last_seen) VALUES (?1, ?2, ?3)")?;
            stmt.bind((1, identity.id.as_str()))?;
            stmt.bind((2, identity.public_key.as_slice()))?;
            stmt.bind((3, now))?;
            stmt.next()?;

            Ok(true)
        })
    }

    fn get_identity(&self, id: &str) -> Result<Identity, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT public_key, last_seen FROM identities WHERE id = ?1")?;
        stmt.bind((1, id))?;

        if let Some(row) = stmt.into_iter().next() {
            let row = row?;

            Ok(Identity {
                id: id.to_owned(),
                public_key: row.read::<&[u8], _>("public_key").to_vec(),
                last_seen: row.read::<Timestamp, _>("last_seen"),
                state: IdentityState::Valid,
            })
        } else {
            Ok(Identity::unknown(id))
        }
    }

    fn identities(&self) -> Result<Vec<Identity>, Error> {
        let stmt = self
            .db
            .prepare("SELECT id, public_key, last_seen FROM identities ORDER BY last_seen DESC")?;
        let mut identities = Vec::new();

        for row in stmt.into_iter() {
            let row = row?;

            identities.push(Identity {
                id: row.read::<&str, _>("id").to_owned(),
                public_key: row.read::<&[u8], _>("public_key").to_vec(),
                last_seen: row.read::<Timestamp, _>("last_seen"),
                state: IdentityState::Valid,
            });
        }
        Ok(identities)
    }

    fn try_add_message(&mut self, message: &Message, now: Timestamp) -> Result<bool, Error> {
        if message.encoded_len() > DOWNLOAD_BATCH_BYTES {
            return Err(Error::MessageTooLarge {
                max: DOWNLOAD_BATCH_BYTES,
                actual: message.encoded_len(),
            });
        }
        let hash = message.hash();

        transaction(&self.db, |db| {
            let mut stmt = db.prepare(
                "INSERT INTO messages (recipient, hash, sender, payload, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT DO NOTHING",
            )?;
            stmt.bind((1, message.id.as_str()))?;
            stmt.bind((2, hash.as_str()))?;
            stmt.bind((3, message.sender_key_id.as_str()))?;
            stmt.bind((4, message.payload.as_slice()))?;
            stmt.bind((5, now))?;
            stmt.next()?;

            let added = db.change_count() > 0;
            if added {
                increment(db, COUNTER_RECEIVED, 1)?;
            }
            Ok(added)
        })
    }

    fn any_news(&self, recipient: &str) -> Result<usize, Error> {
        count(
            &self.db,
            "SELECT COUNT(*) FROM messages WHERE recipient = ?1 AND delivered_at IS NULL",
            [recipient],
        )
        .map_err(Error::from)
    }

    fn get_messages(&mut self, recipient: &str, now: Timestamp) -> Result<Vec<Message>, Error> {
        transaction(&self.db, |db| {
            let mut stmt = db.prepare(
                "SELECT seq, sender, payload FROM messages
                 WHERE recipient = ?1 AND delivered_at IS NULL
                 ORDER BY seq ASC
                 LIMIT ?2",
            )?;
            stmt.bind((1, recipient))?;
            stmt.bind((2, DOWNLOAD_BATCH_SIZE as i64))?;

            let mut seqs = Vec::new();
            let mut messages = Vec::new();
            let mut size = 0;

            for row in stmt.into_iter() {
                let row = row?;
                // The id is reset to the recipient, as uploaded, so that the
                // downloader computes the same content hash.
                let message = Message {
                    id: recipient.to_owned(),
                    sender_key_id: row.read::<&str, _>("sender").to_owned(),
                    payload: row.read::<&[u8], _>("payload").to_vec(),
                    is_downloaded: true,
                };
                size += message.encoded_len();

                // Whatever doesn't fit stays pending for the next download.
                if !messages.is_empty() && size > DOWNLOAD_BATCH_BYTES {
                    break;
                }
                seqs.push(row.read::<i64, _>("seq"));
                messages.push(message);
            }
            for seq in seqs {
                let mut stmt = db.prepare("UPDATE messages SET delivered_at = ?1 WHERE seq = ?2")?;
                stmt.bind((1, now))?;
                stmt.bind((2, seq))?;
                stmt.next()?;
            }
            if !messages.is_empty() {
                increment(db, COUNTER_DELIVERED, messages.len())?;
            }
            Ok(messages)
        })
    }

    fn try_add_resend_request(
        &mut self,
        request: &ResendRequest,
        now: Timestamp,
    ) -> Result<bool, Error> {
        transaction(&self.db, |db| {
            let mut stmt = db.prepare(
                "INSERT INTO resend_requests (id, recipient, received_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT DO NOTHING",
            )?;
            stmt.bind((1, request.id.as_str()))?;
            stmt.bind((2, request.recipient_id.as_str()))?;
            stmt.bind((3, now))?;
            stmt.next()?;

            let added = db.change_count() > 0;

            // Drop the delivered copy.
            let mut stmt = db.prepare(
                "DELETE FROM messages
                 WHERE hash = ?1 AND recipient = ?2 AND delivered_at IS NOT NULL",
            )?;
            stmt.bind((1, request.id.as_str()))?;
            stmt.bind((2, request.recipient_id.as_str()))?;
            stmt.next()?;

            Ok(added)
        })
    }

    fn check_resend(&self, query: &ResendRequest) -> Result<ResendStatus, Error> {
        let bindings = [query.id.as_str(), query.recipient_id.as_str()];
        let message = count(
            &self.db,
            "SELECT COUNT(*) FROM messages WHERE hash = ?1 AND recipient = ?2",
            bindings,
        )?;
        let request = count(
            &self.db,
            "SELECT COUNT(*) FROM resend_requests WHERE id = ?1 AND recipient = ?2",
            bindings,
        )?;

        match (message > 0, request > 0) {
            (false, false) => Ok(ResendStatus::Untraceable),
            (true, false) => Ok(ResendStatus::Pending),
            (false, true) => Ok(ResendStatus::ResendRequired),
            (true, true) => Err(Error::Invariant {
                id: query.id.clone(),
                recipient: query.recipient_id.clone(),
            }),
        }
    }

    fn try_add_group(&mut self, group: &Group) -> Result<bool, Error> {
        let members = serde_json::to_string(&group.members)?;

        transaction(&self.db, |db| {
            let mut stmt = db.prepare("SELECT public_key, modified_at FROM groups WHERE id = ?1")?;
            stmt.bind((1, group.id.as_str()))?;

            if let Some(row) = stmt.into_iter().next() {
                let row = row?;
                if row.read::<&[u8], _>("public_key") != group.public_key.as_slice() {
                    return Err(Error::GroupKeySubstitution(group.id.clone()));
                }
                if row.read::<Timestamp, _>("modified_at") >= group.modified_at {
                    return Ok(false);
                }
            }
            let mut stmt = db.prepare(
                "INSERT INTO groups (id, public_key, members, modified_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT DO UPDATE
                 SET members = ?3, modified_at = ?4",
            )?;
            stmt.bind((1, group.id.as_str()))?;
            stmt.bind((2, group.public_key.as_slice()))?;
            stmt.bind((3, members.as_str()))?;
            stmt.bind((4, group.modified_at))?;
            stmt.next()?;

            Ok(true)
        })
    }

    fn get_group(&self, id: &str) -> Result<Option<Group>, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT public_key, members, modified_at FROM groups WHERE id = ?1")?;
        stmt.bind((1, id))?;

        if let Some(row) = stmt.into_iter().next() {
            let row = row?;
            let members = serde_json::from_str(row.read::<&str, _>("members"))?;

            Ok(Some(Group {
                id: id.to_owned(),
                public_key: row.read::<&[u8], _>("public_key").to_vec(),
                members,
                modified_at: row.read::<Timestamp, _>("modified_at"),
            }))
        } else {
            Ok(None)
        }
    }

    fn prune_delivered(&mut self, before: Timestamp) -> Result<usize, Error> {
        let mut stmt = self.db.prepare(
            "DELETE FROM messages WHERE delivered_at IS NOT NULL AND delivered_at < ?1",
        )?;
        stmt.bind((1, before))?;
        stmt.next()?;

        Ok(self.db.change_count())
    }

    fn stats(&self) -> Result<RepoStats, Error> {
        let start = time::Instant::now();
        let identities = count(&self.db, "SELECT COUNT(*) FROM identities", [])?;
        let messages = count(
            &self.db,
            "SELECT COUNT(*) FROM messages WHERE delivered_at IS NULL",
            [],
        )?;
        let resend_requests = count(&self.db, "SELECT COUNT(*) FROM resend_requests", [])?;
        let total_received = counter(&self.db, COUNTER_RECEIVED)?;
        let total_delivered = counter(&self.db, COUNTER_DELIVERED)?;

        Ok(RepoStats {
            identities,
            messages,
            resend_requests,
            total_received,
            total_delivered,
            elapsed: LocalDuration::from_millis(start.elapsed().as_millis()),
        })
    }
}

fn increment(db: &sql::Connection, name: &str, by: usize) -> Result<(), sql::Error> {
    let mut stmt = db.prepare(
        "INSERT INTO counters (name, value) VALUES (?1, ?2)
         ON CONFLICT DO UPDATE SET value = value + ?2",
    )?;
    stmt.bind((1, name))?;
    stmt.bind((2, by as i64))?;
    stmt.next()?;

    Ok(())
}

fn counter(db: &sql::Connection, name: &str) -> Result<usize, sql::Error> {
    let mut stmt = db.prepare("SELECT value FROM counters WHERE name = ?1")?;
    stmt.bind((1, name))?;

    match stmt.into_iter().next() {
        Some(row) => Ok(row?.read::<i64, _>("value") as usize),
        None => Ok(0),
    }
}
