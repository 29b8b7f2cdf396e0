//! Stream request server.
use std::io::{Read as _, Write as _};
use std::sync::Arc;
use std::{io, net};

use socket2::{Domain, Protocol, Socket, Type};

use relay::node::items;

use crate::connection::IO_TIMEOUT;
use crate::deserializer::{Deserializer, READ_BUFFER_SIZE};
use crate::framing::Framing;
use crate::handler::{Client, Handler};
use crate::runtime::{thread, Shutdown};
use crate::server::{Gate, Permit, POLL_INTERVAL};
use crate::wire::Packet;

/// Bind the request socket.
///
/// The listener blocks on accept, for at most [`POLL_INTERVAL`] at a time.
pub fn bind(addr: net::SocketAddr, backlog: u32) -> io::Result<net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(net::TcpListener::from(socket))
}

/// Accept sockets until shutdown.
///
/// A slot is taken from the gate before each accept, so that once the gate is
/// exhausted, new sockets wait in the backlog.
pub fn listen<S, F>(
    node: &str,
    listener: net::TcpListener,
    handler: Arc<Handler<S, F>>,
    gate: Gate,
    shutdown: Shutdown,
) where
    S: items::Store + Send + 'static,
    F: Framing + 'static,
{
    log::info!(
        target: "server",
        "Accepting requests on {} (max {} sockets)..",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        gate.capacity()
    );

    while !shutdown.is_triggered() {
        let Some(permit) = gate.acquire_timeout(POLL_INTERVAL) else {
            continue;
        };
        match listener.accept() {
            Ok((stream, addr)) => {
                log::debug!(target: "server", "Accepted socket from {addr}");

                let handler = handler.clone();
                let shutdown = shutdown.clone();

                thread::spawn(node, "socket", move || {
                    serve(stream, Client::tcp(addr), &handler, permit, &shutdown)
                });
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                drop(permit);
            }
            Err(e) => {
                log::error!(target: "server", "Failed to accept socket: {e}");
                drop(permit);
                shutdown.wait(POLL_INTERVAL);
            }
        }
    }
    log::debug!(target: "server", "Accept loop stopped");
}

/// Serve a socket until it is closed. The gate slot is released on return.
fn serve<S, F>(
    mut stream: net::TcpStream,
    client: Client,
    handler: &Handler<S, F>,
    _permit: Permit,
    shutdown: &Shutdown,
) where
    S: items::Store,
    F: Framing,
{
    match session(&mut stream, &client, handler, shutdown) {
        Ok(()) => log::debug!(target: "server", "{client}: Socket closed"),
        Err(e) => log::debug!(target: "server", "{client}: Socket closed: {e}"),
    }
    stream.shutdown(net::Shutdown::Both).ok();
}

fn session<S, F>(
    stream: &mut net::TcpStream,
    client: &Client,
    handler: &Handler<S, F>,
    shutdown: &Shutdown,
) -> io::Result<()>
where
    S: items::Store,
    F: Framing,
{
    stream.set_nodelay(true)?;
    // Reads time out so that shutdown is noticed on idle sockets.
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut inbox = Deserializer::<Packet>::default();
    let mut buf = [0; READ_BUFFER_SIZE];

    while !shutdown.is_triggered() {
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        };
        inbox.input(&buf[..n]);

        for packet in inbox.by_ref() {
            match packet {
                Ok(packet) => {
                    let reply = handler.process(packet.body(), client);
                    stream.write_all(reply.as_bytes())?;
                }
                Err(err) => {
                    // The stream can't be resynchronized after a bad prefix.
                    log::debug!(target: "server", "{client}: Invalid packet: {err}");
                    stream.write_all(handler.exception(&err.to_string()).as_bytes())?;

                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
