//! Forwards new items to the relays we are connected to.
//!
//! Requests must never wait on other relays, so commands are queued and sent
//! by a small pool of workers. Failures are published as events.
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as chan;

use crate::command::Command;
use crate::event::Event;
use crate::processor::Forward;
use crate::runtime::{thread, Emitter, Shutdown};
use crate::scheduler::Broadcast;

/// Queues commands for forwarding.
#[derive(Clone)]
pub struct Forwarder {
    queue: chan::Sender<Command>,
    emitter: Emitter<Event>,
}

impl Forwarder {
    /// Spawn the forwarding workers.
    pub fn spawn<B: Broadcast + 'static>(
        node: &str,
        broadcast: Arc<B>,
        capacity: usize,
        workers: usize,
        emitter: Emitter<Event>,
        shutdown: Shutdown,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (queue, work) = chan::bounded::<Command>(capacity);
        let handles = (0..workers.max(1))
            .map(|i| {
                let work = work.clone();
                let broadcast = broadcast.clone();
                let emitter = emitter.clone();
                let shutdown = shutdown.clone();

                thread::spawn(node, format!("forward#{i}"), move || {
                    worker(work, broadcast.as_ref(), &emitter, &shutdown)
                })
            })
            .collect();

        (Self { queue, emitter }, handles)
    }
}

impl Forward for Forwarder {
    fn forward(&self, command: Command) {
        let id = command.id;

        match self.queue.try_send(command) {
            Ok(()) => {}
            Err(chan::TrySendError::Full(_)) => {
                log::warn!(target: "forwarder", "Forward queue is full, dropping {id}");
                self.emitter.emit(Event::Dropped { command: id });
            }
            Err(chan::TrySendError::Disconnected(_)) => {
                log::debug!(target: "forwarder", "Forwarder stopped, dropping {id}");
                self.emitter.emit(Event::Dropped { command: id });
            }
        }
    }
}

fn worker<B: Broadcast + ?Sized>(
    work: chan::Receiver<Command>,
    broadcast: &B,
    emitter: &Emitter<Event>,
    shutdown: &Shutdown,
) {
    let stop = shutdown.receiver();

    loop {
        let command = chan::select! {
            recv(work) -> command => match command {
                Ok(command) => command,
                Err(chan::RecvError) => break,
            },
            recv(stop) -> _ => break,
        };
        forward(&command, broadcast, emitter);
    }
    log::debug!(target: "forwarder", "Worker stopped");
}

fn forward<B: Broadcast + ?Sized>(command: &Command, broadcast: &B, emitter: &Emitter<Event>) {
    match broadcast.send_to_all(command) {
        Ok(replies) => {
            for reply in &replies {
                if let Some(exception) = reply.exception() {
                    log::debug!(target: "forwarder", "Relay rejected {}: {exception}", command.id);
                }
            }
            log::debug!(
                target: "forwarder",
                "Forwarded {} to {} relay(s)", command.id, replies.len()
            );

            emitter.emit(Event::Forwarded {
                command: command.id,
                peers: replies.len(),
            });
        }
        Err(err) => {
            log::debug!(target: "forwarder", "Unable to forward {}: {err}", command.id);

            emitter.emit(Event::ForwardFailed {
                command: command.id,
                reason: err.to_string(),
            });
        }
    }
}
