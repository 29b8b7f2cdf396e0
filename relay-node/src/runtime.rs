pub mod handle;
pub mod thread;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, net, time};

use crossbeam_channel as chan;
use thiserror::Error;

use relay::logger;
use relay::node::items::Store as _;
use relay::node::peer::Store as _;
use relay::node::{db, items, peer, Config, Database};

use crate::balance::Balances;
use crate::event::Event;
use crate::forwarder::Forwarder;
use crate::framing::Plaintext;
use crate::handler::Handler;
use crate::host::{IsSelf, SelfAddrs};
use crate::processor::Processor;
use crate::scheduler::{self, Scheduler};
use crate::server::{self, Gate};
use crate::{LocalDuration, Timestamp};

pub use handle::{Events, Handle};

/// How often node statistics are logged.
pub const STATS_INTERVAL: time::Duration = time::Duration::from_secs(60);
/// How often delivered messages are pruned.
pub const PRUNE_INTERVAL: LocalDuration = LocalDuration::from_mins(30);

/// The scheduler of a running node.
pub type NodeScheduler = Scheduler<Database, Database, Plaintext>;

/// A runtime error.
#[derive(Error, Debug)]
pub enum Error {
    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] db::Error),
    /// An item store error.
    #[error("item store error: {0}")]
    Items(#[from] items::Error),
    /// A peer store error.
    #[error("peer store error: {0}")]
    Peers(#[from] peer::Error),
    /// A scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] scheduler::Error),
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A node thread panicked.
    #[error("the {0} thread panicked")]
    Panic(&'static str),
}

/// Publishes events to subscribers.
#[derive(Debug, Clone)]
pub struct Emitter<T> {
    subscribers: Arc<Mutex<Vec<chan::Sender<T>>>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Emitter<T> {
        Emitter {
            subscribers: Default::default(),
        }
    }
}

impl<T: Clone> Emitter<T> {
    /// Emit event to subscribers and drop those who can't receive it.
    pub(crate) fn emit(&self, event: T) {
        self.subscribers
            .lock()
            .expect("Emitter::emit: lock is not poisoned")
            .retain(|s| s.try_send(event.clone()).is_ok());
    }

    /// Subscribe to events stream.
    pub fn subscribe(&self) -> chan::Receiver<T> {
        let (sender, receiver) = chan::unbounded();
        let mut subs = self
            .subscribers
            .lock()
            .expect("Emitter::subscribe: lock is not poisoned");
        subs.push(sender);

        receiver
    }
}

/// Process-wide shutdown signal.
///
/// Nothing is ever sent on the channel: triggering drops the sender, which
/// wakes up everyone waiting on a receiver.
#[derive(Debug, Clone)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<chan::Sender<()>>>>,
    receiver: chan::Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        let (sender, receiver) = chan::bounded(0);

        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }
}

impl Shutdown {
    /// Trigger the shutdown. Returns `false` if it was already triggered.
    pub fn trigger(&self) -> bool {
        let first = !self.triggered.swap(true, Ordering::SeqCst);

        self.sender
            .lock()
            .expect("Shutdown::trigger: lock is not poisoned")
            .take();

        first
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Wait for the shutdown, at most `timeout`. Returns whether it was triggered.
    pub fn wait(&self, timeout: time::Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Err(chan::RecvTimeoutError::Disconnected) => true,
            _ => self.is_triggered(),
        }
    }

    /// A receiver that is disconnected once the shutdown is triggered.
    pub fn receiver(&self) -> chan::Receiver<()> {
        self.receiver.clone()
    }
}

/// Holds everything a node needs to run.
pub struct Runtime {
    /// Node name, used for thread names.
    pub name: String,
    pub handle: Handle,
    /// Address requests are accepted on.
    pub local_addr: net::SocketAddr,
    /// Address datagrams are accepted on.
    pub udp_addr: Option<net::SocketAddr>,
    config: Config,
    listener: net::TcpListener,
    udp: Option<net::UdpSocket>,
    scheduler: Arc<NodeScheduler>,
    handler: Arc<Handler<Database, Plaintext>>,
    items: Arc<Mutex<Database>>,
    gate: Gate,
    forwarders: Vec<std::thread::JoinHandle<()>>,
    signals: chan::Receiver<()>,
    shutdown: Shutdown,
}

impl Runtime {
    /// Initialize the runtime.
    ///
    /// This function spawns the forwarding workers.
    pub fn init(
        config: Config,
        db: &Path,
        signals: chan::Receiver<()>,
        balances: Arc<dyn Balances>,
    ) -> Result<Runtime, Error> {
        let now = Timestamp::now();

        log::info!(target: "node", "Opening database at {}..", db.display());

        let items = Arc::new(Mutex::new(Database::open(db)?));
        let mut peers = Database::open(db)?;

        for addr in &config.connect {
            peers.insert(*addr, now)?;
        }
        log::info!(target: "node", "{} relay peer(s) known", peers.len()?);

        let listener = server::tcp::bind(config.listen, config.limits.backlog)?;
        let local_addr = listener.local_addr()?;
        let udp = config.udp_listen.map(server::udp::bind).transpose()?;
        let udp_addr = udp.as_ref().map(|s| s.local_addr()).transpose()?;
        let name = local_addr.to_string();

        let is_self: Arc<dyn IsSelf> = Arc::new(
            SelfAddrs::new(local_addr.port(), config.external_addresses.iter().copied()).detect(),
        );
        let emitter: Emitter<Event> = Default::default();
        let shutdown = Shutdown::default();
        let scheduler = Arc::new(Scheduler::new(
            &name,
            scheduler::Config {
                target: config.limits.target_outbound,
                ..scheduler::Config::default()
            },
            peers,
            items.clone(),
            Plaintext,
            is_self,
            emitter.clone(),
            shutdown.clone(),
        ));
        let (forwarder, forwarders) = Forwarder::spawn(
            &name,
            scheduler.clone(),
            config.limits.forward_queue,
            config.limits.forward_workers,
            emitter.clone(),
            shutdown.clone(),
        );
        let processor = Processor::new(items.clone(), Arc::new(forwarder), balances);
        let handler = Arc::new(Handler::new(processor, Plaintext));
        let handle = Handle::new(scheduler.clone(), emitter, shutdown.clone());
        let gate = Gate::new(config.limits.max_inbound);

        Ok(Runtime {
            name,
            handle,
            local_addr,
            udp_addr,
            config,
            listener,
            udp,
            scheduler,
            handler,
            items,
            gate,
            forwarders,
            signals,
            shutdown,
        })
    }

    /// Run the node until shutdown.
    pub fn run(self) -> Result<(), Error> {
        let name = self.name;

        log::info!(target: "node", "Running relay node on {name}..");

        let scheduler = thread::spawn(&name, "scheduler", {
            let scheduler = self.scheduler.clone();
            move || scheduler.run()
        });
        let accept = thread::spawn(&name, "accept", {
            let node = name.clone();
            let handler = self.handler.clone();
            let gate = self.gate.clone();
            let shutdown = self.shutdown.clone();
            let listener = self.listener;
            move || server::tcp::listen(&node, listener, handler, gate, shutdown)
        });
        let udp = self.udp.map(|socket| {
            let handler = self.handler.clone();
            let shutdown = self.shutdown.clone();

            thread::spawn(&name, "udp", move || {
                server::udp::serve(socket, &handler, &shutdown)
            })
        });
        let housekeeping = thread::spawn(&name, "housekeeping", {
            let items = self.items.clone();
            let scheduler = self.scheduler.clone();
            let gate = self.gate.clone();
            let max_age = self.config.limits.delivered_max_age;
            let shutdown = self.shutdown.clone();
            move || housekeeping(&items, &scheduler, &gate, max_age, &shutdown)
        });
        // Not joined: it only exits on a signal or shutdown.
        thread::spawn(&name, "signals", {
            let signals = self.signals;
            let shutdown = self.shutdown.clone();
            let stop = shutdown.receiver();
            move || {
                chan::select! {
                    recv(signals) -> signal => {
                        if signal.is_ok() {
                            log::info!(
                                target: "node",
                                "Termination signal received; shutting down.."
                            );
                            shutdown.trigger();
                        }
                    }
                    recv(stop) -> _ => {}
                }
            }
        });

        let mut threads = vec![
            (accept, "accept"),
            (scheduler, "scheduler"),
            (housekeeping, "housekeeping"),
        ];
        threads.extend(udp.map(|t| (t, "udp")));

        // Any thread exiting brings the node down.
        while !threads.iter().any(|(t, _)| t.is_finished()) {
            if self.shutdown.wait(server::POLL_INTERVAL) {
                break;
            }
        }
        self.shutdown.trigger();

        let mut result = Ok(());
        for (thread, label) in threads {
            result = result.and(join(thread, label));
        }

        for worker in self.forwarders {
            join(worker, "forward").ok();
        }
        log::debug!(target: "node", "Node shutdown completed for {name}");

        result
    }
}

fn join<T>(handle: std::thread::JoinHandle<T>, label: &'static str) -> Result<T, Error> {
    handle.join().map_err(|_| {
        log::error!(target: "node", "The {label} thread panicked");
        Error::Panic(label)
    })
}

/// Periodic statistics and pruning.
fn housekeeping(
    items: &Mutex<Database>,
    scheduler: &NodeScheduler,
    gate: &Gate,
    max_age: LocalDuration,
    shutdown: &Shutdown,
) {
    let mut last_prune = Timestamp::now();

    while !shutdown.wait(STATS_INTERVAL) {
        let now = Timestamp::now();

        match items.lock().expect("housekeeping: lock is not poisoned").stats() {
            Ok(stats) => log::info!(
                target: "node",
                "Stats: identities={} messages={} resend-requests={} \
                 received={} delivered={} ({}ms)",
                stats.identities,
                stats.messages,
                stats.resend_requests,
                stats.total_received,
                stats.total_delivered,
                stats.elapsed.as_millis()
            ),
            Err(e) => log::error!(target: "node", "Failed to compute stats: {e}"),
        }
        log::info!(
            target: "node",
            "Inbound sockets: {}/{}", gate.in_use(), gate.capacity()
        );
        for conn in scheduler.connections() {
            log::info!(
                target: "node",
                "Relay {} is {} (sent={} received={})",
                conn.peer, conn.state, conn.bytes_sent, conn.bytes_received
            );
        }

        if last_prune.elapsed(now) >= PRUNE_INTERVAL {
            let pruned = logger::benchmark("node", "Pruning delivered messages", || {
                items
                    .lock()
                    .expect("housekeeping: lock is not poisoned")
                    .prune_delivered(now - max_age)
            });

            match pruned {
                Ok(n) => log::debug!(target: "node", "Pruned {n} delivered message(s)"),
                Err(e) => log::error!(target: "node", "Failed to prune delivered messages: {e}"),
            }
            last_prune = now;
        }
    }
}
