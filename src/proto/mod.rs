//! Wire protocol: message schemas and newline-delimited JSON framing.

mod frame;
mod wire;

pub use frame::{encode_line, FrameError, LineReader, LineWriter};
pub use wire::{
    now_ms, ChatRecord, Envelope, NodeId, Payload, PeerInfo, SeqNo, Term, DEFAULT_ROOM,
};
