#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod node;
pub mod proto;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch.
pub use crate::config::Config;
pub use crate::node::{DeliverySink, LogSink, NodeHandle};
pub use crate::proto::{ChatRecord, Envelope, NodeId, Payload, PeerInfo, SeqNo, Term};
