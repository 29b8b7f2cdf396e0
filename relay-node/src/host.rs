//! Host collaborator: knowledge about the machine the node runs on.
use std::collections::HashSet;
use std::net;

use crate::node;

/// Tells whether an address belongs to this node.
pub trait IsSelf: Send + Sync {
    fn is_self(&self, addr: &net::SocketAddr) -> bool;
}

impl<F> IsSelf for F
where
    F: Fn(&net::SocketAddr) -> bool + Send + Sync,
{
    fn is_self(&self, addr: &net::SocketAddr) -> bool {
        self(addr)
    }
}

/// Addresses this node is reachable on.
///
/// An address is ours if its IP is one of our own and its port is the port we
/// serve relay requests on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfAddrs {
    ips: HashSet<net::IpAddr>,
    port: u16,
}

impl SelfAddrs {
    /// Create a new set from our listen port and configured external addresses.
    pub fn new(port: u16, external: impl IntoIterator<Item = net::IpAddr>) -> Self {
        let mut ips = external
            .into_iter()
            .map(|ip| ip.to_canonical())
            .collect::<HashSet<_>>();

        ips.insert(net::Ipv4Addr::LOCALHOST.into());
        ips.insert(net::Ipv6Addr::LOCALHOST.into());
        ips.insert(net::Ipv4Addr::UNSPECIFIED.into());
        ips.insert(net::Ipv6Addr::UNSPECIFIED.into());

        Self { ips, port }
    }

    /// Add the local addresses the OS routes public traffic through.
    pub fn detect(mut self) -> Self {
        for target in [
            net::SocketAddr::from(([192, 0, 2, 1], node::DEFAULT_PORT)),
            net::SocketAddr::from(([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], node::DEFAULT_PORT)),
        ] {
            if let Some(ip) = route(target) {
                log::debug!(target: "host", "Detected local address {ip}");
                self.ips.insert(ip.to_canonical());
            }
        }
        self
    }

    /// Our relay port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl IsSelf for SelfAddrs {
    fn is_self(&self, addr: &net::SocketAddr) -> bool {
        let addr = node::canonical(*addr);

        addr.port() == self.port && self.ips.contains(&addr.ip())
    }
}

/// Local address of the interface used to reach `target`. No packets are sent.
fn route(target: net::SocketAddr) -> Option<net::IpAddr> {
    let bind: net::SocketAddr = if target.is_ipv4() {
        (net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = net::UdpSocket::bind(bind).ok()?;

    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
