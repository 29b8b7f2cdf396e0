use std::sync::Arc;
use std::{net, path::PathBuf, process};

use anyhow::Context;
use crossbeam_channel as chan;

use relay::logger;
use relay::node::{self, Config};
use relay_node::balance::Unavailable;
use relay_node::{signals, Runtime, GIT_HEAD, VERSION};

pub const HELP_MSG: &str = r#"
Usage

   relay-node [<option>...]

   Stores messages for offline recipients and forwards new items to other relays.
   Relays to connect to are taken from `--connect`, the `connect` configuration
   field, and the peer store.

Options

    --config             <path>         Config file to use (JSON)
    --db                 <path>         Database file (default: ./relay.db)
    --listen             <address>      Address to accept requests on (default: 0.0.0.0:38334)
    --udp                <address>      Address to accept datagrams on (default: 0.0.0.0:38335)
    --connect            <address>      Relay to connect to (may be repeated)
    --log                <level>        Set log level (default: info)
    --version                           Print program version
    --help                              Print help
"#;

#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    db: Option<PathBuf>,
    listen: Option<net::SocketAddr>,
    udp: Option<net::SocketAddr>,
    connect: Vec<net::SocketAddr>,
    log: Option<log::Level>,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut config = None;
        let mut db = None;
        let mut listen = None;
        let mut udp = None;
        let mut connect = Vec::new();
        let mut log = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Long("config") => {
                    let value = parser.value()?;
                    config = Some(PathBuf::from(value));
                }
                Long("db") => {
                    let value = parser.value()?;
                    db = Some(PathBuf::from(value));
                }
                Long("listen") => {
                    listen = Some(parser.value()?.parse()?);
                }
                Long("udp") => {
                    udp = Some(parser.value()?.parse()?);
                }
                Long("connect") => {
                    let addr = parser.value()?.parse()?;
                    connect.push(addr);
                }
                Long("log") => {
                    log = Some(parser.value()?.parse()?);
                }
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(0);
                }
                Long("version") => {
                    println!("relay-node {VERSION} ({GIT_HEAD})");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }

        Ok(Self {
            config,
            db,
            listen,
            udp,
            connect,
            log,
        })
    }
}

fn execute() -> anyhow::Result<()> {
    let options = Options::from_env()?;
    let mut config = match &options.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("couldn't load config from {}", path.display()))?,
        None => Config::default(),
    };
    let level = options
        .log
        .or_else(|| options.config.as_ref().map(|_| config.log))
        .or_else(logger::env_level)
        .unwrap_or(config.log);

    logger::init(level)?;

    log::info!(target: "node", "Starting node..");
    log::info!(target: "node", "Version {VERSION} ({GIT_HEAD})");

    if let Some(addr) = options.listen {
        config.listen = addr;
    }
    if let Some(addr) = options.udp {
        config.udp_listen = Some(addr);
    }
    config.connect.extend(options.connect);

    let db = options
        .db
        .unwrap_or_else(|| PathBuf::from(node::DEFAULT_DB_NAME));
    let (notify, signals) = chan::bounded(1);
    signals::install(notify)?;

    Runtime::init(config, &db, signals, Arc::new(Unavailable))?.run()?;

    Ok(())
}

fn main() {
    if let Err(err) = execute() {
        if log::log_enabled!(target: "node", log::Level::Error) {
            log::error!(target: "node", "Fatal: {err:#}");
        } else {
            eprintln!("Error: {err:#}");
        }
        process::exit(1);
    }
}
