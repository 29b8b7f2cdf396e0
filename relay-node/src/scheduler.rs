//! Connection scheduler.
//!
//! Keeps a pool of outbound connections to other relays, which new items are
//! forwarded to.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::{io, net, time};

use crossbeam_channel as chan;
use thiserror::Error;

use relay::node::peer::PeerRecord;
use relay::node::{items, peer, Services};

use crate::command::{Command, CommandId};
use crate::connection::{self, Connection, State};
use crate::event::Event;
use crate::framing::Framing;
use crate::host::IsSelf;
use crate::runtime::{thread, Emitter, Shutdown};
use crate::{node, LocalDuration, Timestamp};

/// Target number of outbound connections.
pub const TARGET_OUTBOUND_PEERS: usize = node::config::TARGET_OUTBOUND_PEERS;
/// How often the connection pool is maintained.
pub const MAINTENANCE_INTERVAL: time::Duration = time::Duration::from_secs(30);
/// How long a peer is left alone after a failure attributed to it.
pub const ERROR_COOLDOWN: LocalDuration = LocalDuration::from_secs(60);

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(#[from] connection::Error),
    #[error("item store error: {0}")]
    Items(#[from] items::Error),
    #[error("peer store error: {0}")]
    Peers(#[from] peer::Error),
    #[error("the node is shutting down")]
    Shutdown,
    #[error("no connection available, retry later")]
    NoConnection,
}

impl Error {
    /// Whether the failure should count against the peer.
    pub fn is_peer_fault(&self) -> bool {
        match self {
            Self::Connection(err) => match err.io() {
                Some(err) => is_peer_fault(err),
                None => false,
            },
            Self::Items(_) | Self::Peers(_) | Self::Shutdown | Self::NoConnection => false,
        }
    }
}

/// Whether a socket error means the peer is unreachable or refusing us.
fn is_peer_fault(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => matches!(
            code,
            libc::ECONNREFUSED | libc::ETIMEDOUT | libc::EHOSTUNREACH
        ),
        // Connect timeouts are reported by the standard library without an
        // OS error code.
        None => err.kind() == io::ErrorKind::TimedOut,
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target number of outbound connections.
    pub target: usize,
    /// Maintenance interval.
    pub tick: time::Duration,
    /// How long a failing peer is left alone.
    pub cooldown: LocalDuration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TARGET_OUTBOUND_PEERS,
            tick: MAINTENANCE_INTERVAL,
            cooldown: ERROR_COOLDOWN,
        }
    }
}

/// Something that can send a command to every connected relay.
pub trait Broadcast: Send + Sync {
    /// Send a command to every connected relay, returning their replies.
    fn send_to_all(&self, command: &Command) -> Result<Vec<Command>, Error>;
}

/// Snapshot of an outbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub peer: String,
    pub state: State,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

/// Select the next peer to connect to.
///
/// Peers that are active, ours, or that failed within the cooldown are skipped.
/// The most recently seen peer wins; ties go to the peer that has been quiet
/// the longest since its last error.
pub fn select<'a>(
    records: &'a [PeerRecord],
    now: Timestamp,
    is_active: impl Fn(&str) -> bool,
    is_self: &dyn IsSelf,
    cooldown: LocalDuration,
) -> Option<&'a PeerRecord> {
    records
        .iter()
        .filter(|r| !is_active(&r.id))
        .filter(|r| !is_self.is_self(&r.addr()))
        .filter(|r| r.last_error.map_or(true, |t| t.elapsed(now) >= cooldown))
        .min_by_key(|r| {
            (
                r.last_seen.elapsed(now).as_millis(),
                // Peers that never failed sort first.
                r.last_error
                    .map(|t| std::cmp::Reverse(t.elapsed(now).as_millis())),
            )
        })
}

/// Manages the outbound connection pool.
pub struct Scheduler<P, S, F> {
    /// Name used for the threads we spawn.
    name: String,
    config: Config,
    peers: Mutex<P>,
    items: Arc<Mutex<S>>,
    /// Active connections, keyed by peer id.
    connections: Mutex<HashMap<String, Arc<Mutex<Connection>>>>,
    /// Held while seeding a new connection or broadcasting, so that the two
    /// never interleave on the same connections.
    send: Mutex<()>,
    framing: F,
    is_self: Arc<dyn IsSelf>,
    emitter: Emitter<Event>,
    shutdown: Shutdown,
    wake: (chan::Sender<()>, chan::Receiver<()>),
}

impl<P, S, F> Scheduler<P, S, F>
where
    P: peer::Store + Send + 'static,
    S: items::Store + Send + 'static,
    F: Framing + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl ToString,
        config: Config,
        peers: P,
        items: Arc<Mutex<S>>,
        framing: F,
        is_self: Arc<dyn IsSelf>,
        emitter: Emitter<Event>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            peers: Mutex::new(peers),
            items,
            connections: Mutex::new(HashMap::new()),
            send: Mutex::new(()),
            framing,
            is_self,
            emitter,
            shutdown,
            wake: chan::bounded(1),
        }
    }

    /// Run the maintenance loop until shutdown.
    pub fn run(self: Arc<Self>) {
        log::info!(
            target: "scheduler",
            "Maintaining {} outbound connection(s) every {}s..",
            self.config.target,
            self.config.tick.as_secs()
        );
        let shutdown = self.shutdown.receiver();

        while !self.shutdown.is_triggered() {
            match self.maintain(Timestamp::now()) {
                Ok(_) => {}
                Err(Error::Shutdown) => break,
                Err(err) => {
                    log::error!(target: "scheduler", "Failed to maintain connections: {err}");
                }
            }
            let stop = chan::select! {
                recv(self.wake.1) -> _ => false,
                recv(shutdown) -> _ => true,
                default(self.config.tick) => false,
            };
            if stop {
                break;
            }
        }
        self.disconnect_all();

        log::debug!(target: "scheduler", "Scheduler stopped");
    }

    /// Start connection attempts until the target is reached or we run out
    /// of candidates. Returns the number of attempts started.
    pub fn maintain(self: &Arc<Self>, now: Timestamp) -> Result<usize, Error> {
        let records = self.peers().entries()?;
        let mut connections = self
            .connections
            .lock()
            .expect("Scheduler::maintain: lock is not poisoned");
        let mut started = 0;

        while connections.len() < self.config.target {
            if self.shutdown.is_triggered() {
                return Err(Error::Shutdown);
            }
            let Some(peer) = select(
                &records,
                now,
                |id| connections.contains_key(id),
                self.is_self.as_ref(),
                self.config.cooldown,
            ) else {
                log::info!(
                    target: "scheduler",
                    "Out of candidates with {}/{} connection(s) and {} known peer(s)",
                    connections.len(), self.config.target, records.len()
                );
                break;
            };
            let peer = peer.clone();
            let conn = Arc::new(Mutex::new(Connection::new(peer.clone())));

            match connections.entry(peer.id.clone()) {
                Entry::Occupied(_) => {
                    log::error!(target: "scheduler", "Peer {} is already connected", peer.id);
                    debug_assert!(false, "Scheduler::maintain: peer {} added twice", peer.id);
                    break;
                }
                Entry::Vacant(e) => {
                    e.insert(conn.clone());
                }
            }
            log::debug!(target: "scheduler", "Connecting to {}..", peer.id);

            let scheduler = self.clone();
            thread::spawn(&self.name, "connect", move || {
                scheduler.connect_and_run(peer, conn)
            });
            started += 1;
        }
        Ok(started)
    }

    /// Send a command to every connected relay, returning their replies.
    ///
    /// A failing connection is dropped without affecting delivery to the others.
    pub fn send_to_all(&self, command: &Command) -> Result<Vec<Command>, Error> {
        let _send = self.send.lock().expect("Scheduler::send_to_all: lock is not poisoned");
        let connections = self
            .connections
            .lock()
            .expect("Scheduler::send_to_all: lock is not poisoned")
            .iter()
            .map(|(id, conn)| (id.clone(), conn.clone()))
            .collect::<Vec<_>>();
        let mut replies = Vec::new();
        let mut available = false;

        for (id, conn) in connections {
            let result = {
                let mut conn = conn.lock().expect("Scheduler::send_to_all: lock is not poisoned");
                if !conn.is_connected() {
                    continue;
                }
                available = true;
                conn.request(&self.framing, command)
            };
            match result {
                Ok(reply) => replies.push(reply),
                Err(err) => self.handle_failed(&id, &conn, &err.into(), Timestamp::now()),
            }
        }
        if !available {
            return Err(Error::NoConnection);
        }
        Ok(replies)
    }

    /// Record a peer advertised by the host network. Only relays are kept.
    pub fn receive_advertised_peer(
        &self,
        ip: net::IpAddr,
        port: u16,
        services: Services,
    ) -> Result<bool, Error> {
        if !services.has(Services::MESSAGE_RELAY) {
            return Ok(false);
        }
        // The advertised port is the host protocol's, relays use their own.
        let addr = net::SocketAddr::new(ip, node::DEFAULT_PORT);
        let added = self.peers().insert(addr, Timestamp::now())?;

        if added {
            log::debug!(target: "scheduler", "Discovered relay {addr} (advertised port {port})");
        }
        Ok(added)
    }

    /// Add a relay peer, and wake the scheduler up.
    pub fn add_peer(&self, addr: net::SocketAddr) -> Result<bool, Error> {
        let added = self.peers().insert(addr, Timestamp::now())?;
        self.wake();

        Ok(added)
    }

    /// Run maintenance as soon as possible.
    pub fn wake(&self) {
        self.wake.0.try_send(()).ok();
    }

    /// Snapshot of the outbound connections.
    pub fn connections(&self) -> Vec<ConnectionStats> {
        let connections = self
            .connections
            .lock()
            .expect("Scheduler::connections: lock is not poisoned")
            .values()
            .cloned()
            .collect::<Vec<_>>();

        connections
            .iter()
            .map(|conn| {
                let conn = conn.lock().expect("Scheduler::connections: lock is not poisoned");

                ConnectionStats {
                    peer: conn.peer().id.clone(),
                    state: conn.state(),
                    bytes_sent: conn.bytes_sent(),
                    bytes_received: conn.bytes_received(),
                }
            })
            .collect()
    }

    /// Number of connected relays.
    pub fn connected(&self) -> usize {
        self.connections()
            .iter()
            .filter(|c| c.state == State::Connected)
            .count()
    }

    fn connect_and_run(&self, peer: PeerRecord, conn: Arc<Mutex<Connection>>) {
        if let Err(err) = self.connect(&peer, &conn) {
            self.handle_failed(&peer.id, &conn, &err, Timestamp::now());
        }
    }

    fn connect(&self, peer: &PeerRecord, conn: &Arc<Mutex<Connection>>) -> Result<(), Error> {
        // Not holding the connection lock while dialing keeps broadcasts from
        // waiting on us.
        let stream = Connection::dial(peer.addr()).map_err(connection::Error::from)?;

        if self.shutdown.is_triggered() {
            return Err(Error::Shutdown);
        }
        conn.lock().expect("Scheduler::connect: lock is not poisoned").attach(stream)?;
        self.peers().connected(&peer.id, Timestamp::now())?;

        let _send = self.send.lock().expect("Scheduler::connect: lock is not poisoned");
        let mut conn = conn.lock().expect("Scheduler::connect: lock is not poisoned");

        conn.transition(State::Connected)?;

        let identities = self.items().identities()?;
        for identity in &identities {
            if self.shutdown.is_triggered() {
                return Err(Error::Shutdown);
            }
            let publish = Command::new(CommandId::PublishIdentity, identity)
                .map_err(connection::Error::from)?;
            let reply = conn.request(&self.framing, &publish)?;
            if let Some(exception) = reply.exception() {
                log::debug!(
                    target: "scheduler",
                    "{}: Identity {} was not accepted: {exception}", peer.id, identity.id
                );
            }
        }
        log::info!(
            target: "scheduler",
            "Connected to {} (seeded {} identities)", peer.id, identities.len()
        );
        self.emitter.emit(Event::PeerConnected {
            peer: peer.id.clone(),
        });

        Ok(())
    }

    fn handle_failed(&self, id: &str, conn: &Arc<Mutex<Connection>>, err: &Error, now: Timestamp) {
        self.connections
            .lock()
            .expect("Scheduler::handle_failed: lock is not poisoned")
            .remove(id);
        {
            let mut conn = conn.lock().expect("Scheduler::handle_failed: lock is not poisoned");
            conn.fail().ok();
            conn.dispose().ok();
        }
        let penalized = !self.shutdown.is_triggered() && err.is_peer_fault();

        if penalized {
            log::info!(target: "scheduler", "Connection to {id} failed: {err}");

            if let Err(e) = self.peers().record_error(id, now) {
                log::error!(target: "scheduler", "Failed to record error for {id}: {e}");
            }
        } else {
            log::debug!(target: "scheduler", "Connection to {id} closed: {err}");
        }
        self.emitter.emit(Event::PeerDisconnected {
            peer: id.to_owned(),
            penalized,
        });
    }

    fn disconnect_all(&self) {
        let connections = self
            .connections
            .lock()
            .expect("Scheduler::disconnect_all: lock is not poisoned")
            .drain()
            .collect::<Vec<_>>();

        for (_, conn) in connections {
            let mut conn = conn.lock().expect("Scheduler::disconnect_all: lock is not poisoned");
            conn.fail().ok();
            conn.dispose().ok();
        }
    }

    fn peers(&self) -> MutexGuard<'_, P> {
        self.peers.lock().expect("Scheduler::peers: lock is not poisoned")
    }

    fn items(&self) -> MutexGuard<'_, S> {
        self.items.lock().expect("Scheduler::items: lock is not poisoned")
    }
}

impl<P, S, F> Broadcast for Scheduler<P, S, F>
where
    P: peer::Store + Send + 'static,
    S: items::Store + Send + 'static,
    F: Framing + 'static,
{
    fn send_to_all(&self, command: &Command) -> Result<Vec<Command>, Error> {
        Scheduler::send_to_all(self, command)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use qcheck_macros::quickcheck;

    use super::*;
    use crate::framing::Plaintext;
    use crate::host::SelfAddrs;
    use crate::node::Database;
    use relay::assert_matches;

    fn record(addr: &str, seen: u64, error: Option<u64>) -> PeerRecord {
        let mut r = PeerRecord::new(addr.parse().unwrap(), Timestamp::from(seen));
        r.last_error = error.map(Timestamp::from);
        r
    }

    fn nobody() -> Arc<dyn IsSelf> {
        Arc::new(|_: &net::SocketAddr| false)
    }

    fn scheduler() -> Arc<Scheduler<Database, Database, Plaintext>> {
        Arc::new(Scheduler::new(
            "test",
            Config::default(),
            Database::memory().unwrap(),
            Arc::new(Mutex::new(Database::memory().unwrap())),
            Plaintext,
            nobody(),
            Emitter::default(),
            Shutdown::default(),
        ))
    }

    #[test]
    fn test_select_prefers_fresh_peers() {
        let now = 1_000_000;
        let a = record("10.0.0.1:38334", now - 5_000, None);
        let b = record("10.0.0.2:38334", now - 60_000, Some(now - 200_000));
        let records = [b, a.clone()];

        let selected = select(
            &records,
            Timestamp::from(now),
            |_| false,
            nobody().as_ref(),
            ERROR_COOLDOWN,
        );
        assert_eq!(selected, Some(&a));
    }

    #[test]
    fn test_select_tie_break() {
        let now = 1_000_000;
        let quiet = record("10.0.0.1:38334", now, Some(now - 500_000));
        let noisy = record("10.0.0.2:38334", now, Some(now - 100_000));
        let never = record("10.0.0.3:38334", now, None);
        let records = [noisy, quiet.clone(), never.clone()];

        let now = Timestamp::from(now);
        let nobody = nobody();

        let selected = select(&records, now, |_| false, nobody.as_ref(), ERROR_COOLDOWN);
        assert_eq!(selected, Some(&never));

        let selected = select(&records[..2], now, |_| false, nobody.as_ref(), ERROR_COOLDOWN);
        assert_eq!(selected, Some(&quiet));
    }

    #[test]
    fn test_select_exclusions() {
        let now = 1_000_000;
        let active = record("10.0.0.1:38334", now, None);
        let ours = record("10.0.0.2:38334", now, None);
        let failing = record("10.0.0.3:38334", now, Some(now - 59_999));
        let records = [active.clone(), ours, failing];
        let is_self = SelfAddrs::new(38334, ["10.0.0.2".parse().unwrap()]);

        assert_eq!(
            select(&records, Timestamp::from(now), |id| id == active.id, &is_self, ERROR_COOLDOWN),
            None
        );
        // Once the cooldown is over, the failing peer is eligible again.
        let selected = select(
            &records,
            Timestamp::from(now + 1),
            |id| id == active.id,
            &is_self,
            ERROR_COOLDOWN,
        )
        .unwrap();
        assert_eq!(selected.id, "10.0.0.3:38334");
    }

    #[quickcheck]
    fn prop_select(peers: Vec<(u8, u16, Option<u32>, bool)>) -> bool {
        let now = Timestamp::from(10_000_000);
        let records = peers
            .iter()
            .map(|(host, seen, error, _)| {
                record(
                    &format!("10.0.0.{host}:38334"),
                    *now - *seen as u64,
                    error.map(|e| *now - (e % 1_000_000) as u64),
                )
            })
            .collect::<Vec<_>>();
        let active = peers
            .iter()
            .filter(|(.., active)| *active)
            .map(|(host, ..)| format!("10.0.0.{host}:38334"))
            .collect::<HashSet<_>>();
        let is_self = SelfAddrs::new(38334, ["10.0.0.1".parse().unwrap()]);
        let eligible = |r: &PeerRecord| {
            !active.contains(&r.id)
                && r.address != net::IpAddr::from([10, 0, 0, 1])
                && r.last_error.map_or(true, |t| t.elapsed(now) >= ERROR_COOLDOWN)
        };

        match select(&records, now, |id| active.contains(id), &is_self, ERROR_COOLDOWN) {
            Some(selected) => {
                eligible(selected)
                    && records
                        .iter()
                        .filter(|r| eligible(r))
                        .all(|r| r.last_seen <= selected.last_seen)
            }
            None => !records.iter().any(eligible),
        }
    }

    #[test]
    fn test_error_classification() {
        let failed = |err: io::Error| Error::Connection(connection::Error::Io(err));
        let os = |code| failed(io::Error::from_raw_os_error(code));

        assert!(os(libc::ECONNREFUSED).is_peer_fault());
        assert!(os(libc::EHOSTUNREACH).is_peer_fault());
        assert!(os(libc::ETIMEDOUT).is_peer_fault());
        assert!(!os(libc::ENETDOWN).is_peer_fault());
        assert!(!os(libc::ENETUNREACH).is_peer_fault());
        assert!(!os(libc::ECONNRESET).is_peer_fault());
        assert!(!Error::Shutdown.is_peer_fault());
        assert!(!Error::Connection(connection::Error::Closed).is_peer_fault());
        assert!(failed(io::ErrorKind::TimedOut.into()).is_peer_fault());
    }

    #[test]
    fn test_send_to_all_without_connections() {
        let scheduler = scheduler();

        assert_matches!(
            scheduler.send_to_all(&Command::new(CommandId::AnyNews, "bob").unwrap()),
            Err(Error::NoConnection)
        );
    }

    #[test]
    fn test_maintain_without_candidates() {
        let scheduler = scheduler();

        assert_eq!(scheduler.maintain(Timestamp::now()).unwrap(), 0);
        assert!(scheduler.connections().is_empty());
    }

    /// Peer store that counts how often the peer list is read.
    struct Counting {
        inner: Database,
        reads: Arc<AtomicUsize>,
    }

    impl peer::Store for Counting {
        fn get(&self, id: &str) -> Result<Option<PeerRecord>, peer::Error> {
            self.inner.get(id)
        }

        fn insert(&mut self, addr: net::SocketAddr, seen: Timestamp) -> Result<bool, peer::Error> {
            self.inner.insert(addr, seen)
        }

        fn entries(&self) -> Result<Vec<PeerRecord>, peer::Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.entries()
        }

        fn len(&self) -> Result<usize, peer::Error> {
            self.inner.len()
        }

        fn connected(&mut self, id: &str, time: Timestamp) -> Result<(), peer::Error> {
            self.inner.connected(id, time)
        }

        fn record_error(&mut self, id: &str, time: Timestamp) -> Result<(), peer::Error> {
            self.inner.record_error(id, time)
        }
    }

    #[test]
    fn test_run_waits_between_ticks() {
        let reads = Arc::new(AtomicUsize::new(0));
        let shutdown = Shutdown::default();
        let peers = Counting {
            inner: Database::memory().unwrap(),
            reads: reads.clone(),
        };
        let config = Config {
            tick: time::Duration::from_millis(50),
            ..Config::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            "test",
            config,
            peers,
            Arc::new(Mutex::new(Database::memory().unwrap())),
            Plaintext,
            nobody(),
            Emitter::default(),
            shutdown.clone(),
        ));
        let handle = std::thread::spawn(move || scheduler.run());

        std::thread::sleep(time::Duration::from_millis(300));
        shutdown.trigger();
        handle.join().unwrap();

        let reads = reads.load(Ordering::SeqCst);
        assert!((2..=20).contains(&reads), "maintenance ran {reads} time(s)");
    }

    #[test]
    fn test_refused_connection_is_penalized() {
        let scheduler = scheduler();
        let events = scheduler.emitter.subscribe();
        let addr = {
            let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let id = node::peer_id(&addr);

        assert!(scheduler.add_peer(addr).unwrap());
        assert_eq!(scheduler.maintain(Timestamp::now()).unwrap(), 1);

        let event = events.recv_timeout(time::Duration::from_secs(10)).unwrap();
        assert_eq!(
            event,
            Event::PeerDisconnected {
                peer: id.clone(),
                penalized: true
            }
        );
        assert!(scheduler.connections().is_empty());

        let record = peer::Store::get(&*scheduler.peers(), &id).unwrap().unwrap();
        assert_eq!(record.error_score, 1);
        // The peer is cooling down.
        assert_eq!(scheduler.maintain(Timestamp::now()).unwrap(), 0);
    }

    #[test]
    fn test_advertised_peers() {
        let scheduler = scheduler();
        let ip: net::IpAddr = "10.0.0.9".parse().unwrap();

        assert!(!scheduler.receive_advertised_peer(ip, 8333, Services::NONE).unwrap());
        assert!(scheduler
            .receive_advertised_peer(ip, 8333, Services::MESSAGE_RELAY)
            .unwrap());

        let entries = peer::Store::entries(&*scheduler.peers()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].port, node::DEFAULT_PORT);
    }
}
