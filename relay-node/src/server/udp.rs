//! Datagram request server.
use std::{io, net};

use relay::node::items;

use crate::framing::Framing;
use crate::handler::{Client, Handler};
use crate::runtime::Shutdown;
use crate::server::POLL_INTERVAL;

/// Largest datagram we accept.
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// Bind the datagram socket.
pub fn bind(addr: net::SocketAddr) -> io::Result<net::UdpSocket> {
    let socket = net::UdpSocket::bind(addr)?;
    // Reads time out so that shutdown is noticed.
    socket.set_read_timeout(Some(POLL_INTERVAL))?;

    Ok(socket)
}

/// Answer datagrams until shutdown. Requests that can't be understood get no reply.
pub fn serve<S, F>(socket: net::UdpSocket, handler: &Handler<S, F>, shutdown: &Shutdown)
where
    S: items::Store,
    F: Framing,
{
    log::info!(
        target: "server",
        "Accepting datagrams on {}..",
        socket.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    let mut buf = vec![0; MAX_DATAGRAM_SIZE];

    while !shutdown.is_triggered() {
        let (n, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                // Eg. an ICMP error from a previous reply.
                log::debug!(target: "server", "Failed to receive datagram: {e}");
                continue;
            }
        };
        let client = Client::udp(addr);

        if let Some(reply) = handler.process_datagram(&buf[..n], &client) {
            if let Err(e) = socket.send_to(reply.as_bytes(), addr) {
                log::debug!(target: "server", "{client}: Failed to send reply: {e}");
            }
        }
    }
    log::debug!(target: "server", "Datagram server stopped");
}
