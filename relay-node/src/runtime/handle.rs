use std::ops::Deref;
use std::sync::Arc;
use std::{net, time};

use crossbeam_channel as chan;

use relay::node::Services;

use crate::event::Event;
use crate::runtime::{Emitter, Error, NodeScheduler, Shutdown};
use crate::scheduler::ConnectionStats;

/// Controls a running node.
#[derive(Clone)]
pub struct Handle {
    scheduler: Arc<NodeScheduler>,
    /// Publishes events to subscribers.
    emitter: Emitter<Event>,
    shutdown: Shutdown,
}

/// Events feed.
pub struct Events(chan::Receiver<Event>);

impl Deref for Events {
    type Target = chan::Receiver<Event>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Events {
    /// Listen for events, and wait for the given predicate to return true,
    /// or timeout if the specified amount of time has elapsed.
    pub fn wait<F>(
        &self,
        mut f: F,
        timeout: time::Duration,
    ) -> Result<Event, chan::RecvTimeoutError>
    where
        F: FnMut(&Event) -> bool,
    {
        let start = time::Instant::now();

        loop {
            if let Some(timeout) = timeout.checked_sub(start.elapsed()) {
                match self.recv_timeout(timeout) {
                    Ok(event) => {
                        if f(&event) {
                            return Ok(event);
                        }
                    }
                    Err(err @ chan::RecvTimeoutError::Disconnected) => {
                        return Err(err);
                    }
                    Err(chan::RecvTimeoutError::Timeout) => {
                        // Keep trying until our timeout reaches zero.
                        continue;
                    }
                }
            } else {
                return Err(chan::RecvTimeoutError::Timeout);
            }
        }
    }
}

impl Handle {
    pub fn new(scheduler: Arc<NodeScheduler>, emitter: Emitter<Event>, shutdown: Shutdown) -> Self {
        Self {
            scheduler,
            emitter,
            shutdown,
        }
    }

    /// Subscribe to events stream.
    pub fn events(&self) -> Events {
        Events(self.emitter.subscribe())
    }

    /// Add a relay peer and try to connect to it.
    pub fn connect(&self, addr: net::SocketAddr) -> Result<bool, Error> {
        self.scheduler.add_peer(addr).map_err(Error::from)
    }

    /// Record a peer advertised by the host network.
    pub fn receive_advertised_peer(
        &self,
        ip: net::IpAddr,
        port: u16,
        services: Services,
    ) -> Result<bool, Error> {
        self.scheduler
            .receive_advertised_peer(ip, port, services)
            .map_err(Error::from)
    }

    /// Outbound connections.
    pub fn connections(&self) -> Vec<ConnectionStats> {
        self.scheduler.connections()
    }

    /// Stop the node. Returns `false` if it was already stopping.
    pub fn shutdown(&self) -> bool {
        self.shutdown.trigger()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }
}
