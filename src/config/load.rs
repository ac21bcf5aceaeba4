//! Config file loading and environment overrides.

use std::fs;
use std::path::{Path, PathBuf};

use super::{Config, ConfigError, PeerSpec};
use crate::proto::NodeId;

pub const DEFAULT_CONFIG_FILE: &str = "totem.toml";

/// Load configuration. Explicit path wins, then `TOTEM_CONFIG`, then
/// `./totem.toml` if present, then built-in defaults. Environment
/// overrides apply last.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match resolve_path(path) {
        Some(path) => read_file(&path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn resolve_path(path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os("TOTEM_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from(DEFAULT_CONFIG_FILE);
    default.exists().then_some(default)
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Some(raw) = env_var("TOTEM_NODE_ID") {
        let id = raw.parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
            var: "TOTEM_NODE_ID",
            value: raw,
        })?;
        config.node_id = NodeId::new(id);
    }

    if let Some(raw) = env_var("TOTEM_LISTEN") {
        let (host, port) = raw.rsplit_once(':').ok_or_else(|| ConfigError::InvalidEnv {
            var: "TOTEM_LISTEN",
            value: raw.clone(),
        })?;
        let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidEnv {
            var: "TOTEM_LISTEN",
            value: raw.clone(),
        })?;
        config.listen_host = host.to_string();
        config.listen_port = port;
    }

    if let Some(raw) = env_var("TOTEM_SEEDS") {
        let mut seeds = Vec::new();
        for part in raw.split(',').filter(|part| !part.trim().is_empty()) {
            seeds.push(part.trim().parse::<PeerSpec>()?);
        }
        config.seed_peers = seeds;
    }

    if let Some(raw) = env_var("TOTEM_LOG_DIR") {
        config.log_dir = PathBuf::from(raw);
    }

    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}
