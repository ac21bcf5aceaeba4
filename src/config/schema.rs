//! Node configuration schema and safety limits.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::proto::{NodeId, PeerInfo};

use super::ConfigError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: NodeId,
    pub listen_host: String,
    pub listen_port: u16,
    /// Address peers should dial back. Defaults to `listen_host`, except a
    /// wildcard listener advertises the loopback address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
    pub seed_peers: Vec<PeerSpec>,
    pub heartbeat_interval_ms: u64,
    pub leader_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub log_dir: PathBuf,
    pub limits: Limits,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(1),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 7001,
            advertise_host: None,
            seed_peers: Vec::new(),
            heartbeat_interval_ms: 800,
            leader_timeout_ms: 2500,
            election_timeout_ms: 500,
            log_dir: PathBuf::from("./data/logs"),
            limits: Limits::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// This node's own peer info as advertised to the cluster.
    pub fn self_info(&self) -> PeerInfo {
        let host = match &self.advertise_host {
            Some(host) => host.clone(),
            None if self.listen_host == "0.0.0.0" => "127.0.0.1".to_string(),
            None => self.listen_host.clone(),
        };
        PeerInfo::new(self.node_id, host, self.listen_port)
    }

    pub fn seeds(&self) -> Vec<PeerInfo> {
        self.seed_peers
            .iter()
            .map(|spec| spec.to_peer_info())
            .filter(|peer| peer.peer_id != self.node_id)
            .collect()
    }
}

/// Seed peer written as `peer_id:host:port` in config files and CLI flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSpec {
    pub peer_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl PeerSpec {
    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.peer_id, self.host.clone(), self.port)
    }
}

impl FromStr for PeerSpec {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSeed {
            value: value.to_string(),
        };
        let (id, rest) = value.split_once(':').ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            peer_id: NodeId::new(id.parse().map_err(|_| invalid())?),
            host: host.to_string(),
            port: port.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for PeerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.peer_id, self.host, self.port)
    }
}

impl Serialize for PeerSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Safety limits with explicit units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_line_bytes: usize,
    pub max_buffered_messages: usize,
    pub dedup_window: u64,
    pub catchup_batch: usize,
    pub connect_timeout_ms: u64,
    pub send_queue_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_line_bytes: 1024 * 1024,
            max_buffered_messages: 4096,
            dedup_window: 1024,
            catchup_batch: 512,
            connect_timeout_ms: 3000,
            send_queue_depth: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            format: LogFormat::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_spec_parses() {
        let spec: PeerSpec = "3:127.0.0.1:7003".parse().expect("parse");
        assert_eq!(spec.peer_id, NodeId::new(3));
        assert_eq!(spec.host, "127.0.0.1");
        assert_eq!(spec.port, 7003);
        assert_eq!(spec.to_string(), "3:127.0.0.1:7003");
    }

    #[test]
    fn peer_spec_rejects_garbage() {
        for bad in ["", "3", "3:host", "x:host:1", "3:host:port", "3::7001"] {
            assert!(bad.parse::<PeerSpec>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let mut cfg = Config::default();
        cfg.node_id = NodeId::new(2);
        cfg.listen_port = 7002;
        cfg.seed_peers = vec!["1:127.0.0.1:7001".parse().expect("seed")];
        cfg.logging.format = LogFormat::Json;

        let rendered = toml::to_string_pretty(&cfg).expect("render");
        let loaded: Config = toml::from_str(&rendered).expect("parse");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn wildcard_listener_advertises_loopback() {
        let mut cfg = Config::default();
        cfg.listen_host = "0.0.0.0".to_string();
        assert_eq!(cfg.self_info().host, "127.0.0.1");

        cfg.advertise_host = Some("10.0.0.9".to_string());
        assert_eq!(cfg.self_info().host, "10.0.0.9");
    }

    #[test]
    fn seeds_exclude_self() {
        let mut cfg = Config::default();
        cfg.node_id = NodeId::new(2);
        cfg.seed_peers = vec![
            "1:127.0.0.1:7001".parse().expect("seed"),
            "2:127.0.0.1:7002".parse().expect("seed"),
        ];
        let seeds = cfg.seeds();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].peer_id, NodeId::new(1));
    }
}
