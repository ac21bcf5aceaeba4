use thiserror::Error;

use crate::config::ConfigError;
use crate::node::{StorageError, TransportError};
use crate::proto::FrameError;

/// Crate-level convenience error: a thin wrapper over the per-subsystem
/// errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
