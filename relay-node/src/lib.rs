#![cfg_attr(not(test), warn(clippy::unwrap_used))]

pub mod balance;
pub mod connection;
pub mod deserializer;
pub mod event;
pub mod forwarder;
pub mod framing;
pub mod handler;
pub mod host;
pub mod processor;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod signals;

pub use localtime::{LocalDuration, LocalTime};
pub use relay::node::Timestamp;
pub use relay::{command, hash, item, node, wire};
pub use runtime::Runtime;

/// Node version, as reported by `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Commit the node was built from.
pub const GIT_HEAD: &str = env!("GIT_HEAD");

pub mod prelude {
    pub use crate::command::{Command, CommandId};
    pub use crate::deserializer::Deserializer;
    pub use crate::event::Event;
    pub use crate::item::{Group, Identity, Message, ResendRequest};
    pub use crate::node::{Database, Services};
    pub use crate::{LocalDuration, LocalTime, Timestamp};
}
