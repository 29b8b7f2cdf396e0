#![cfg_attr(not(test), warn(clippy::unwrap_used))]

pub mod command;
pub mod hash;
pub mod item;
#[cfg(feature = "logger")]
pub mod logger;
pub mod node;
pub mod serde_ext;
pub mod sql;
#[cfg(any(test, feature = "test"))]
pub mod test;
pub mod wire;

pub mod prelude {
    use super::*;

    pub use command::{Command, CommandId};
    pub use item::{Group, Identity, Message, ResendRequest, ResendStatus};
    pub use node::{Database, Services, Timestamp};
}
