mod services;

pub mod config;
pub mod db;
pub mod items;
pub mod peer;
pub mod timestamp;

use std::net;

pub use config::Config;
pub use db::Database;
pub use services::Services;
pub use timestamp::Timestamp;

/// Default relay request port.
pub const DEFAULT_PORT: u16 = 38334;
/// Default relay datagram port.
pub const DEFAULT_UDP_PORT: u16 = 38335;
/// Default file name of the node database.
pub const DEFAULT_DB_NAME: &str = "relay.db";

/// Identifier of a relay peer, derived from its address and port.
pub fn peer_id(addr: &net::SocketAddr) -> String {
    canonical(*addr).to_string()
}

/// Canonicalize a socket address, turning IPv4-mapped IPv6 addresses into IPv4.
pub fn canonical(addr: net::SocketAddr) -> net::SocketAddr {
    net::SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_peer_id() {
        let v4: net::SocketAddr = "10.0.0.1:38334".parse().unwrap();
        let mapped: net::SocketAddr = "[::ffff:10.0.0.1]:38334".parse().unwrap();
        let v6: net::SocketAddr = "[2001:db8::1]:38334".parse().unwrap();

        assert_eq!(peer_id(&v4), "10.0.0.1:38334");
        assert_eq!(peer_id(&mapped), peer_id(&v4));
        assert_eq!(peer_id(&v6), "[2001:db8::1]:38334");
    }
}
