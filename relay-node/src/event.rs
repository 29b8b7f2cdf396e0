use crate::command::CommandId;

/// Events published by a running node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An outbound relay connection was established and seeded.
    PeerConnected { peer: String },
    /// An outbound relay connection failed or was closed.
    PeerDisconnected { peer: String, penalized: bool },
    /// A command was forwarded to the given number of relays.
    Forwarded { command: CommandId, peers: usize },
    /// A command couldn't be forwarded.
    ForwardFailed { command: CommandId, reason: String },
    /// The forward queue was full, and a command was dropped.
    Dropped { command: CommandId },
}
