use std::path::Path;
use std::{fs, io, net};

use localtime::LocalDuration;
use thiserror::Error;

use crate::node::{DEFAULT_PORT, DEFAULT_UDP_PORT};

/// Target number of outbound relay connections.
pub const TARGET_OUTBOUND_PEERS: usize = 32;
/// Maximum number of concurrently served inbound sockets.
pub const MAX_INBOUND: usize = 1000;
/// Listen backlog of the request socket.
pub const LISTEN_BACKLOG: u32 = 100;

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration parameters defining attributes of minima and maxima.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    /// Max concurrent inbound sockets.
    pub max_inbound: usize,
    /// Listen backlog.
    pub backlog: u32,
    /// Number of outbound relay connections to maintain.
    pub target_outbound: usize,
    /// Capacity of the forward queue.
    pub forward_queue: usize,
    /// Number of forwarding workers.
    pub forward_workers: usize,
    /// How long to keep messages after they were downloaded.
    #[serde(with = "crate::serde_ext::seconds")]
    pub delivered_max_age: LocalDuration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_inbound: MAX_INBOUND,
            backlog: LISTEN_BACKLOG,
            target_outbound: TARGET_OUTBOUND_PEERS,
            forward_queue: 256,
            forward_workers: 2,
            delivered_max_age: LocalDuration::from_mins(60),
        }
    }
}

/// Relay node configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address to accept requests on.
    #[serde(default = "defaults::listen")]
    pub listen: net::SocketAddr,
    /// Address to accept datagram requests on.
    #[serde(default = "defaults::udp_listen")]
    pub udp_listen: Option<net::SocketAddr>,
    /// Our own public addresses.
    #[serde(default)]
    pub external_addresses: Vec<net::IpAddr>,
    /// Relays to add to the peer store on startup.
    #[serde(default)]
    pub connect: Vec<net::SocketAddr>,
    /// Configured limits.
    #[serde(default)]
    pub limits: Limits,
    /// Log level.
    #[serde(default = "defaults::log", with = "crate::serde_ext::string")]
    pub log: log::Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            udp_listen: defaults::udp_listen(),
            external_addresses: vec![],
            connect: vec![],
            limits: Limits::default(),
            log: defaults::log(),
        }
    }
}

impl Config {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let config = serde_json::from_reader(io::BufReader::new(file))?;

        Ok(config)
    }

    /// A configuration listening on ephemeral loopback ports.
    pub fn test() -> Self {
        let localhost = net::Ipv4Addr::LOCALHOST;

        Self {
            listen: (localhost, 0).into(),
            udp_listen: Some((localhost, 0).into()),
            ..Self::default()
        }
    }
}

/// Defaults as functions, for serde.
mod defaults {
    use std::net;

    use super::{DEFAULT_PORT, DEFAULT_UDP_PORT};

    pub fn listen() -> net::SocketAddr {
        (net::Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into()
    }

    pub fn udp_listen() -> Option<net::SocketAddr> {
        Some((net::Ipv4Addr::UNSPECIFIED, DEFAULT_UDP_PORT).into())
    }

    pub fn log() -> log::Level {
        log::Level::Info
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.udp_listen.map(|a| a.port()), Some(DEFAULT_UDP_PORT));
        assert_eq!(config.limits, Limits::default());
        assert_eq!(config.log, log::Level::Info);
    }

    #[test]
    fn test_config_fields() {
        let config: Config = serde_json::from_str(
            r#"{
                "listen": "127.0.0.1:9000",
                "udpListen": null,
                "externalAddresses": ["203.0.113.7"],
                "connect": ["198.51.100.1:38334"],
                "limits": { "targetOutbound": 4, "deliveredMaxAge": 60 },
                "log": "debug"
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.udp_listen, None);
        assert_eq!(config.external_addresses.len(), 1);
        assert_eq!(config.connect.len(), 1);
        assert_eq!(config.limits.target_outbound, 4);
        assert_eq!(config.limits.max_inbound, MAX_INBOUND);
        assert_eq!(config.limits.delivered_max_age, LocalDuration::from_secs(60));
        assert_eq!(config.log, log::Level::Debug);
    }

    #[test]
    fn test_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        fs::write(&path, r#"{ "limits": { "forwardWorkers": 4 } }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.limits.forward_workers, 4);
        assert!(Config::load(&tmp.path().join("missing.json")).is_err());
    }
}
