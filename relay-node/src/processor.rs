//! Command processor.
//!
//! Maps commands to item store operations. Items that a store operation reports
//! as new are handed to the forwarder; items we already had are not, which is
//! what stops them from circulating between relays forever.
use std::sync::{Arc, Mutex};

use thiserror::Error;

use relay::node::items;

use crate::balance;
use crate::balance::{Balances, Query};
use crate::command::{Command, CommandId};
use crate::item::{Group, Identity, Message, ResendRequest, ResendStatus};
use crate::wire::{self, Encode};
use crate::Timestamp;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed payload: {0}")]
    Payload(#[from] wire::Error),
    #[error(transparent)]
    Store(#[from] items::Error),
    #[error(transparent)]
    Balance(#[from] balance::Error),
    #[error("no messages to download, check AnyNews first")]
    NoMessages,
    #[error("unexpected command {0}")]
    Unexpected(CommandId),
    #[error("unable to encode reply: {0}")]
    Reply(wire::Error),
}

impl Error {
    /// Whether the error is our fault, rather than the client's.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Store(items::Error::Internal(_)) | Self::Reply(_))
    }
}

/// Build a reply carrying an encoded payload.
fn reply<T: Encode + ?Sized>(id: CommandId, payload: &T) -> Result<Command, Error> {
    Command::new(id, payload).map_err(Error::Reply)
}

/// Hands new items to other relays. Must not block.
pub trait Forward: Send + Sync {
    fn forward(&self, command: Command);
}

/// Items that are never forwarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl Forward for Discard {
    fn forward(&self, _command: Command) {}
}

/// Executes commands against the item store.
pub struct Processor<S> {
    items: Arc<Mutex<S>>,
    forward: Arc<dyn Forward>,
    balances: Arc<dyn Balances>,
}

impl<S> Clone for Processor<S> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            forward: self.forward.clone(),
            balances: self.balances.clone(),
        }
    }
}

impl<S: items::Store> Processor<S> {
    pub fn new(
        items: Arc<Mutex<S>>,
        forward: Arc<dyn Forward>,
        balances: Arc<dyn Balances>,
    ) -> Self {
        Self {
            items,
            forward,
            balances,
        }
    }

    /// Execute a command, returning the response.
    pub fn execute(&self, command: &Command, now: Timestamp) -> Result<Command, Error> {
        match command.id {
            CommandId::AnyNews => {
                let recipient: String = command.decode_payload()?;
                let count = self.items().any_news(&recipient)?;

                reply(CommandId::AnyNewsResponse, &u8::from(count > 0))
            }
            CommandId::CheckForResendRequest => {
                let query: ResendRequest = command.decode_payload()?;
                let status = match self.items().check_resend(&query) {
                    Ok(status) => status,
                    Err(err @ items::Error::Invariant { .. }) => {
                        log::error!(target: "store", "{err}");
                        // Answered as if only the resend request existed.
                        ResendStatus::ResendRequired
                    }
                    Err(err) => return Err(err.into()),
                };
                reply(
                    CommandId::CheckForResendRequestResponse,
                    &u8::from(status),
                )
            }
            CommandId::DownloadMessages => {
                let recipient: String = command.decode_payload()?;
                let messages = self.items().get_messages(&recipient, now)?;

                if messages.is_empty() {
                    return Err(Error::NoMessages);
                }
                log::debug!(
                    target: "store",
                    "Delivering {} message(s) to {recipient}", messages.len()
                );
                reply(CommandId::DownloadMessagesResponse, &messages)
            }
            CommandId::UploadMessage => {
                let message: Message = command.decode_payload()?;
                let ack = format!("{};{}", message.sender_key_id, message.sender_key_id);

                if self.items().try_add_message(&message, now)? {
                    self.forward.forward(command.clone());
                }
                reply(CommandId::UploadMessageResponse, &ack)
            }
            CommandId::UploadResendRequest => {
                let request: ResendRequest = command.decode_payload()?;

                if self.items().try_add_resend_request(&request, now)? {
                    self.forward.forward(command.clone());
                }
                reply(
                    CommandId::UploadResendRequestResponse,
                    &request.id,
                )
            }
            CommandId::GetIdentity => {
                let id: String = command.decode_payload()?;
                let identity = self.items().get_identity(&id)?;

                reply(CommandId::GetIdentityResponse, &identity)
            }
            CommandId::PublishIdentity => {
                let identity: Identity = command.decode_payload()?;

                if self.items().try_add_identity(&identity, now)? {
                    log::info!(target: "store", "Identity {} was published", identity.id);
                    self.forward.forward(command.clone());
                }
                reply(CommandId::PublishIdentityResponse, &identity.id)
            }
            CommandId::GetGroup => {
                let id: String = command.decode_payload()?;
                let group = self.items().get_group(&id)?;
                let mut payload = Vec::new();

                match group {
                    Some(group) => {
                        1u8.encode(&mut payload).map_err(|e| Error::Reply(e.into()))?;
                        group.encode(&mut payload).map_err(|e| Error::Reply(e.into()))?;
                    }
                    None => {
                        0u8.encode(&mut payload).map_err(|e| Error::Reply(e.into()))?;
                    }
                }
                Ok(Command::raw(CommandId::GetGroupResponse, payload))
            }
            CommandId::PublishGroup => {
                let group: Group = command.decode_payload()?;

                if self.items().try_add_group(&group)? {
                    self.forward.forward(command.clone());
                }
                reply(CommandId::PublishGroupResponse, &group.id)
            }
            CommandId::Balance => {
                let query: String = command.decode_payload()?;
                let response = self.balances.balance(&Query::parse(&query)?)?;

                Ok(Command::raw(CommandId::BalanceResponse, response))
            }
            CommandId::Outputs => {
                let query: String = command.decode_payload()?;
                let response = self.balances.outputs(&Query::parse(&query)?)?;

                Ok(Command::raw(CommandId::OutputsResponse, response))
            }
            other => Err(Error::Unexpected(other)),
        }
    }

    /// Lock the item store.
    fn items(&self) -> std::sync::MutexGuard<'_, S> {
        self.items.lock().expect("Processor::items: lock is not poisoned")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel as chan;
    use crate::balance::Unavailable;
    use crate::node::Database;
    use relay::assert_matches;
    use relay::test::fixtures;

    impl Forward for chan::Sender<Command> {
        fn forward(&self, command: Command) {
            self.try_send(command).ok();
        }
    }

    fn processor() -> (Processor<Database>, chan::Receiver<Command>) {
        let (send, recv) = chan::unbounded();
        let items = Arc::new(Mutex::new(Database::memory().unwrap()));

        (
            Processor::new(items, Arc::new(send), Arc::new(Unavailable)),
            recv,
        )
    }

    fn now() -> Timestamp {
        Timestamp::from(1_000_000)
    }

    #[test]
    fn test_upload_forwards_once() {
        let (processor, forwarded) = processor();
        let msg = fixtures::message("bob");
        let upload = Command::new(CommandId::UploadMessage, &msg).unwrap();

        let reply = processor.execute(&upload, now()).unwrap();
        assert_eq!(reply.id, CommandId::UploadMessageResponse);
        assert_eq!(reply.decode_payload::<String>().unwrap(), "dyn-key;dyn-key");
        assert_eq!(forwarded.try_recv().unwrap(), upload);

        processor.execute(&upload, now()).unwrap();
        assert!(forwarded.try_recv().is_err());
    }

    #[test]
    fn test_any_news_and_download() {
        let (processor, _forwarded) = processor();
        let msg = fixtures::message("bob");
        let any_news = Command::new(CommandId::AnyNews, "bob").unwrap();
        let download = Command::new(CommandId::DownloadMessages, "bob").unwrap();

        processor
            .execute(&Command::new(CommandId::UploadMessage, &msg).unwrap(), now())
            .unwrap();
        let reply = processor.execute(&any_news, now()).unwrap();
        assert_eq!(reply.decode_payload::<u8>().unwrap(), 1);

        let reply = processor.execute(&download, now()).unwrap();
        let messages = reply.decode_payload::<Vec<Message>>().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "bob");
        assert_eq!(messages[0].payload, msg.payload);

        let reply = processor.execute(&any_news, now()).unwrap();
        assert_eq!(reply.decode_payload::<u8>().unwrap(), 0);
        assert_matches!(
            processor.execute(&download, now()),
            Err(Error::NoMessages)
        );
    }

    #[test]
    fn test_resend_status() {
        let (processor, forwarded) = processor();
        let msg = fixtures::message("bob");
        let request = ResendRequest::new(msg.hash(), "bob");
        let check = Command::new(CommandId::CheckForResendRequest, &request).unwrap();
        let status = |p: &Processor<Database>| {
            p.execute(&check, now())
                .unwrap()
                .decode_payload::<u8>()
                .unwrap()
        };

        assert_eq!(status(&processor), 0);
        processor
            .execute(&Command::new(CommandId::UploadMessage, &msg).unwrap(), now())
            .unwrap();
        assert_eq!(status(&processor), 1);
        processor
            .execute(&Command::new(CommandId::DownloadMessages, "bob").unwrap(), now())
            .unwrap();
        assert_eq!(status(&processor), 1);

        let reply = processor
            .execute(&Command::new(CommandId::UploadResendRequest, &request).unwrap(), now())
            .unwrap();
        assert_eq!(reply.decode_payload::<String>().unwrap(), request.id);
        assert_eq!(status(&processor), 2);
        assert_eq!(forwarded.len(), 2);
    }

    #[test]
    fn test_resend_dual_presence_is_answered() {
        let (processor, _forwarded) = processor();
        let msg = fixtures::message("bob");
        let request = ResendRequest::new(msg.hash(), "bob");

        processor
            .execute(&Command::new(CommandId::UploadMessage, &msg).unwrap(), now())
            .unwrap();
        processor
            .execute(&Command::new(CommandId::UploadResendRequest, &request).unwrap(), now())
            .unwrap();

        let reply = processor
            .execute(&Command::new(CommandId::CheckForResendRequest, &request).unwrap(), now())
            .unwrap();
        assert_eq!(reply.decode_payload::<u8>().unwrap(), 2);
    }

    #[test]
    fn test_publish_identity() {
        let (processor, forwarded) = processor();
        let identity = fixtures::identity();
        let publish = Command::new(CommandId::PublishIdentity, &identity).unwrap();

        let reply = processor.execute(&publish, now()).unwrap();
        assert_eq!(reply.decode_payload::<String>().unwrap(), identity.id);
        processor.execute(&publish, now()).unwrap();
        assert_eq!(forwarded.len(), 1);

        let reply = processor
            .execute(&Command::new(CommandId::GetIdentity, &identity.id).unwrap(), now())
            .unwrap();
        let stored = reply.decode_payload::<Identity>().unwrap();
        assert_eq!(stored.public_key, identity.public_key);

        let mut forged = fixtures::identity();
        forged.id = identity.id.clone();
        assert_matches!(
            processor.execute(&Command::new(CommandId::PublishIdentity, &forged).unwrap(), now()),
            Err(Error::Store(items::Error::IdMismatch(_)))
        );
        assert_eq!(forwarded.len(), 1);
    }

    #[test]
    fn test_groups() {
        let (processor, forwarded) = processor();
        let group = fixtures::group(Timestamp::from(5));
        let get = Command::new(CommandId::GetGroup, &group.id).unwrap();

        let reply = processor.execute(&get, now()).unwrap();
        assert_eq!(reply.payload, vec![0]);

        processor
            .execute(&Command::new(CommandId::PublishGroup, &group).unwrap(), now())
            .unwrap();
        let reply = processor.execute(&get, now()).unwrap();
        assert_eq!(reply.payload[0], 1);
        assert_eq!(wire::deserialize::<Group>(&reply.payload[1..]).unwrap(), group);
        assert_eq!(forwarded.len(), 1);
    }

    #[test]
    fn test_balance_unavailable() {
        let (processor, _) = processor();

        assert_matches!(
            processor.execute(&Command::new(CommandId::Balance, "addr;0").unwrap(), now()),
            Err(Error::Balance(balance::Error::Unavailable))
        );
        assert_matches!(
            processor.execute(&Command::new(CommandId::Outputs, "addr").unwrap(), now()),
            Err(Error::Balance(balance::Error::InvalidQuery(_)))
        );
    }

    #[test]
    fn test_unexpected_and_malformed() {
        let (processor, _) = processor();

        assert_matches!(
            processor.execute(&Command::raw(CommandId::AnyNewsResponse, vec![1]), now()),
            Err(Error::Unexpected(CommandId::AnyNewsResponse))
        );
        assert_matches!(
            processor.execute(&Command::raw(CommandId::UploadMessage, vec![0, 9]), now()),
            Err(Error::Payload(_))
        );
    }

    #[test]
    fn test_group_timestamp_out_of_range() {
        let (processor, forwarded) = processor();
        let mut group = fixtures::group(now());
        group.modified_at = Timestamp::from(u64::MAX);

        let publish = Command::new(CommandId::PublishGroup, &group).unwrap();
        let err = processor.execute(&publish, now()).unwrap_err();

        assert_matches!(err, Error::Payload(wire::Error::InvalidTimestamp(_)));
        assert!(!err.is_internal());
        assert!(forwarded.is_empty());
    }

    #[test]
    fn test_unencodable_reply() {
        let ack = "x".repeat(70_000);
        let err = reply(CommandId::UploadMessageResponse, ack.as_str()).unwrap_err();

        assert_matches!(err, Error::Reply(wire::Error::Io(_)));
        assert!(err.is_internal());
    }
}
