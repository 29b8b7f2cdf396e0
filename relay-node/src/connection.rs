//! Outbound relay connections.
use std::io::{Read as _, Write as _};
use std::{fmt, io, net, time};

use thiserror::Error;

use relay::node::peer::PeerRecord;

use crate::command::Command;
use crate::deserializer::{Deserializer, READ_BUFFER_SIZE};
use crate::framing::{self, Framing};
use crate::wire::{self, Packet};

/// How long to wait for a connection to be established.
pub const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(10);
/// How long a read or write may stall before the connection is considered dead.
pub const IO_TIMEOUT: time::Duration = time::Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid packet: {0}")]
    Wire(#[from] wire::Error),
    #[error("invalid envelope: {0}")]
    Framing(#[from] framing::Error),
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: State, to: State },
    #[error("connection is {0}")]
    NotConnected(State),
    #[error("connection closed by peer")]
    Closed,
}

impl Error {
    /// The underlying I/O error, if any.
    pub fn io(&self) -> Option<&io::Error> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Connection attempt in progress.
    Connecting,
    /// Ready to exchange commands.
    Connected,
    /// The connection failed and must be disposed of.
    Failed,
    /// Closed and released.
    Disposed,
}

impl State {
    /// Whether moving to `to` is allowed.
    pub fn can_transition(self, to: State) -> bool {
        matches!(
            (self, to),
            (Self::Connecting, Self::Connected)
                | (Self::Connecting | Self::Connected | Self::Failed, Self::Failed)
                | (Self::Connected | Self::Failed, Self::Disposed)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// An outbound connection to a relay peer.
#[derive(Debug)]
pub struct Connection {
    peer: PeerRecord,
    state: State,
    stream: Option<net::TcpStream>,
    inbox: Deserializer<Packet>,
    bytes_sent: usize,
    bytes_received: usize,
}

impl Connection {
    /// A connection that is about to be attempted.
    pub fn new(peer: PeerRecord) -> Self {
        Self {
            peer,
            state: State::Connecting,
            stream: None,
            inbox: Deserializer::default(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Open the socket. The connection stays in the connecting state until
    /// [`Connection::transition`] marks it connected.
    pub fn connect(&mut self) -> Result<(), Error> {
        if self.state != State::Connecting {
            return Err(Error::NotConnected(self.state));
        }
        let stream = Self::dial(self.peer.addr())?;

        self.attach(stream)
    }

    /// Open a socket to a relay.
    pub fn dial(addr: net::SocketAddr) -> Result<net::TcpStream, io::Error> {
        let stream = net::TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;

        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        Ok(stream)
    }

    /// Use a socket opened with [`Connection::dial`].
    pub fn attach(&mut self, stream: net::TcpStream) -> Result<(), Error> {
        if self.state != State::Connecting {
            return Err(Error::NotConnected(self.state));
        }
        self.stream = Some(stream);

        Ok(())
    }

    /// Send a packet.
    pub fn send(&mut self, packet: &Packet) -> Result<(), Error> {
        let stream = self.stream()?;

        stream.write_all(packet.as_bytes())?;
        stream.flush()?;
        self.bytes_sent += packet.as_bytes().len();

        Ok(())
    }

    /// Receive the next packet, blocking until one is complete.
    pub fn receive(&mut self) -> Result<Packet, Error> {
        let mut buf = [0; READ_BUFFER_SIZE];

        loop {
            if let Some(packet) = self.inbox.deserialize_next()? {
                return Ok(packet);
            }
            let n = self.stream()?.read(&mut buf)?;
            if n == 0 {
                return Err(Error::Closed);
            }
            self.bytes_received += n;
            self.inbox.input(&buf[..n]);
        }
    }

    /// Send a command and wait for the reply.
    pub fn request<F: Framing + ?Sized>(
        &mut self,
        framing: &F,
        command: &Command,
    ) -> Result<Command, Error> {
        let envelope = framing.wrap(&wire::serialize(command))?;
        self.send(&Packet::new(&envelope)?)?;

        let reply = self.receive()?;
        let unwrapped = framing.unwrap(reply.body())?;

        Ok(wire::deserialize(&unwrapped.payload)?)
    }

    /// Move to a new state.
    pub fn transition(&mut self, to: State) -> Result<(), Error> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;

        Ok(())
    }

    /// Mark the connection as failed.
    pub fn fail(&mut self) -> Result<(), Error> {
        self.transition(State::Failed)
    }

    /// Close the socket and release the connection.
    pub fn dispose(&mut self) -> Result<(), Error> {
        self.transition(State::Disposed)?;

        if let Some(stream) = self.stream.take() {
            stream.shutdown(net::Shutdown::Both).ok();
        }
        Ok(())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    pub fn peer(&self) -> &PeerRecord {
        &self.peer
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    fn stream(&mut self) -> Result<&mut net::TcpStream, Error> {
        match (self.state, self.stream.as_mut()) {
            (State::Connecting | State::Connected, Some(stream)) => Ok(stream),
            (state, _) => Err(Error::NotConnected(state)),
        }
    }
}
