//! The chat cluster node: membership, failure detection, election,
//! total-order delivery, persistence, and the runtime gluing them.

pub mod election;
pub mod failure;
pub mod membership;
pub mod metrics;
pub mod ordering;
mod run;
mod state;
pub mod storage;
mod transport;

pub use run::{run, start, DeliverySink, Event, LogSink, NodeHandle};
pub use state::{Action, NodeState, Role};
pub use storage::{MessageLog, StorageError};
pub use transport::{Outbound, Server, TransportError};
