//! Request handler.
//!
//! A single handler instance serves every inbound socket, hence it keeps no
//! per-connection state. Everything that may fail on the way from request to
//! reply is turned into a framed [`CommandId::ServerException`].
use std::{fmt, net};

use relay::node::items;

use crate::command::{Command, CommandId};
use crate::framing::{Framing, Unwrapped};
use crate::processor::Processor;
use crate::wire::{self, Packet};
use crate::Timestamp;

/// Transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// The client a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Client {
    pub addr: net::SocketAddr,
    pub transport: Transport,
}

impl Client {
    pub fn tcp(addr: net::SocketAddr) -> Self {
        Self {
            addr,
            transport: Transport::Tcp,
        }
    }

    pub fn udp(addr: net::SocketAddr) -> Self {
        Self {
            addr,
            transport: Transport::Udp,
        }
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            Transport::Tcp => write!(f, "tcp://{}", self.addr),
            Transport::Udp => write!(f, "udp://{}", self.addr),
        }
    }
}

/// Turns request packets into reply packets.
pub struct Handler<S, F> {
    processor: Processor<S>,
    framing: F,
}

impl<S: items::Store, F: Framing> Handler<S, F> {
    pub fn new(processor: Processor<S>, framing: F) -> Self {
        Self {
            processor,
            framing,
        }
    }

    /// Process a packet body received over a stream. Always returns a reply.
    pub fn process(&self, body: &[u8], client: &Client) -> Packet {
        match self.framing.unwrap(body) {
            Ok(unwrapped) => self.respond(unwrapped, client),
            Err(err) => {
                log::debug!(target: "handler", "{client}: Unable to unwrap envelope: {err}");
                self.exception(&err.to_string())
            }
        }
    }

    /// Process a datagram. Returns `None` when no reply should be sent.
    pub fn process_datagram(&self, datagram: &[u8], client: &Client) -> Option<Packet> {
        if datagram.is_empty() {
            return None;
        }
        let packet = match wire::deserialize::<Packet>(datagram) {
            Ok(packet) => packet,
            Err(err) => {
                log::debug!(target: "handler", "{client}: Invalid datagram: {err}");
                return None;
            }
        };
        match self.framing.unwrap(packet.body()) {
            Ok(unwrapped) => Some(self.respond(unwrapped, client)),
            Err(err) => {
                log::debug!(target: "handler", "{client}: Unable to unwrap envelope: {err}");
                None
            }
        }
    }

    fn respond(&self, unwrapped: Unwrapped, client: &Client) -> Packet {
        let command = match wire::deserialize::<Command>(&unwrapped.payload) {
            Ok(command) => command,
            Err(err) => {
                log::debug!(target: "handler", "{client}: Invalid command: {err}");
                return self.exception(&err.to_string());
            }
        };
        log::trace!(
            target: "handler",
            "{client}: Received {} ({} byte(s), authenticated={})",
            command.id, command.payload.len(), unwrapped.authenticated
        );

        let reply = match self.processor.execute(&command, Timestamp::now()) {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_internal() {
                    log::error!(
                        target: "handler",
                        "{client}: Command {} threw an Exception: {err}", command.id
                    );
                } else {
                    log::debug!(
                        target: "handler",
                        "{client}: Command {} threw an Exception: {err}", command.id
                    );
                }
                Command::server_exception(&err.to_string())
            }
        };
        self.reply(&reply, command.id)
    }

    /// A framed exception reply.
    pub fn exception(&self, text: &str) -> Packet {
        let command = Command::server_exception(text);

        self.frame(&command).unwrap_or_else(|err| {
            log::error!(target: "handler", "Unable to frame exception reply: {err}");
            Packet::default()
        })
    }

    fn reply(&self, reply: &Command, request: CommandId) -> Packet {
        match self.frame(reply) {
            Ok(packet) => packet,
            Err(err) => {
                log::error!(target: "handler", "Unable to frame reply to {request}: {err}");
                self.exception(&format!("unable to send reply to {request}: {err}"))
            }
        }
    }

    fn frame(&self, command: &Command) -> Result<Packet, FrameError> {
        let envelope = self.framing.wrap(&wire::serialize(command))?;
        let packet = Packet::new(&envelope)?;

        Ok(packet)
    }
}

#[derive(thiserror::Error, Debug)]
enum FrameError {
    #[error(transparent)]
    Framing(#[from] crate::framing::Error),
    #[error(transparent)]
    Wire(#[from] wire::Error),
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::balance::Unavailable;
    use crate::framing::{self, Plaintext};
    use crate::item::Message;
    use crate::node::Database;
    use crate::processor::Discard;
    use crate::wire::packet::MAX_PACKET_SIZE;
    use relay::test::fixtures;

    fn handler() -> Handler<Database, Plaintext> {
        let items = Arc::new(Mutex::new(Database::memory().unwrap()));
        let processor = Processor::new(items, Arc::new(Discard), Arc::new(Unavailable));

        Handler::new(processor, Plaintext)
    }

    fn client() -> Client {
        Client::tcp(([127, 0, 0, 1], 9999).into())
    }

    fn request(command: &Command) -> Vec<u8> {
        Plaintext.wrap(&wire::serialize(command)).unwrap()
    }

    fn response(packet: &Packet) -> Command {
        let unwrapped = Plaintext.unwrap(packet.body()).unwrap();
        wire::deserialize(&unwrapped.payload).unwrap()
    }

    #[test]
    fn test_process() {
        let handler = handler();
        let msg = fixtures::message("bob");

        let upload = Command::new(CommandId::UploadMessage, &msg).unwrap();
        let reply = handler.process(&request(&upload), &client());
        assert_eq!(response(&reply).id, CommandId::UploadMessageResponse);

        let news = Command::new(CommandId::AnyNews, "bob").unwrap();
        let reply = handler.process(&request(&news), &client());
        assert_eq!(response(&reply).payload, vec![1]);
    }

    #[test]
    fn test_garbage_gets_exception() {
        let handler = handler();

        for garbage in [&[][..], &[7, 1, 2][..], &[framing::PLAINTEXT_VERSION, 0, 99][..]] {
            let reply = response(&handler.process(garbage, &client()));
            assert_eq!(reply.id, CommandId::ServerException);
            assert!(reply.exception().is_some());
        }
    }

    #[test]
    fn test_processor_error_gets_exception() {
        let handler = handler();
        let reply = handler.process(
            &request(&Command::new(CommandId::DownloadMessages, "nobody").unwrap()),
            &client(),
        );

        assert_eq!(
            response(&reply).exception().unwrap(),
            "no messages to download, check AnyNews first"
        );
    }

    #[test]
    fn test_datagram() {
        let handler = handler();
        let client = Client::udp(([127, 0, 0, 1], 9999).into());
        let body = request(&Command::new(CommandId::AnyNews, "bob").unwrap());
        let datagram = wire::serialize(&Packet::new(&body).unwrap());

        let reply = handler.process_datagram(&datagram, &client).unwrap();
        assert_eq!(response(&reply).payload, vec![0]);

        assert!(handler.process_datagram(&[], &client).is_none());
        assert!(handler.process_datagram(&[0, 0, 0, 9, 1], &client).is_none());

        let unframed = wire::serialize(&Packet::new(&[7, 0, 10]).unwrap());
        assert!(handler.process_datagram(&unframed, &client).is_none());
    }

    #[test]
    fn test_oversized_sender_key_gets_exception() {
        let handler = handler();
        let mut msg = fixtures::message("bob");
        msg.sender_key_id = "k".repeat(40_000);

        let upload = Command::new(CommandId::UploadMessage, &msg).unwrap();
        let reply = response(&handler.process(&request(&upload), &client()));
        assert_eq!(reply.id, CommandId::ServerException);

        let news = Command::new(CommandId::AnyNews, "bob").unwrap();
        let reply = handler.process(&request(&news), &client());
        assert_eq!(response(&reply).payload, vec![0]);
    }

    #[test]
    fn test_large_messages_download_one_at_a_time() {
        let handler = handler();

        for byte in [1, 2] {
            let msg = Message::new("bob", "dyn-key", vec![byte; 600_000]);
            let upload = Command::new(CommandId::UploadMessage, &msg).unwrap();
            let reply = response(&handler.process(&request(&upload), &client()));
            assert_eq!(reply.id, CommandId::UploadMessageResponse);
        }
        let download = Command::new(CommandId::DownloadMessages, "bob").unwrap();

        for _ in 0..2 {
            let reply = handler.process(&request(&download), &client());
            assert!(reply.body().len() <= MAX_PACKET_SIZE);

            let messages = response(&reply).decode_payload::<Vec<Message>>().unwrap();
            assert_eq!(messages.len(), 1);
        }
        let reply = response(&handler.process(&request(&download), &client()));
        assert_eq!(reply.id, CommandId::ServerException);
    }
}
