//! Configuration: TOML file, environment overrides, CLI flags on top.

use std::path::PathBuf;

use thiserror::Error;

mod load;
mod schema;

pub use load::{load, DEFAULT_CONFIG_FILE};
pub use schema::{Config, Limits, LogFormat, LoggingConfig, PeerSpec};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid seed peer {value:?}, expected peer_id:host:port")]
    InvalidSeed { value: String },
    #[error("invalid address {value:?}, expected host:port")]
    InvalidAddr { value: String },
    #[error("invalid {var} value {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}
