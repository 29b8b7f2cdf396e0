//! Inbound servers.
//!
//! Requests arrive on a stream socket, served by one thread per accepted
//! socket, and on a datagram socket.
pub mod gate;
pub mod tcp;
pub mod udp;

use std::time;

pub use gate::{Gate, Permit};

/// How often blocked servers check for shutdown.
pub const POLL_INTERVAL: time::Duration = time::Duration::from_millis(250);
