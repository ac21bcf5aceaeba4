//! Wire protocol types and the persisted chat record.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default room for every message that does not name one.
pub const DEFAULT_ROOM: &str = "general";

fn default_room() -> String {
    DEFAULT_ROOM.to_string()
}

/// Cluster-wide unique node identity. Higher ids have higher election
/// priority.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> u64 {
        value.0
    }
}

/// Leadership epoch. Strictly increases across successful elections.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Term {
        Term(self.0.checked_add(1).expect("term overflow"))
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in the total order. Assigned by the leader, starting at 1;
/// zero means "nothing delivered yet".
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqNo(u64);

impl SeqNo {
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> SeqNo {
        SeqNo(self.0.checked_add(1).expect("seq_no overflow"))
    }
}

impl fmt::Debug for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNo({})", self.0)
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How to reach a peer. Immutable once known; identity is the `peer_id`,
/// not the socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl PeerInfo {
    pub fn new(peer_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id,
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}@{}:{}", self.peer_id, self.host, self.port)
    }
}

/// One frame on the wire: a common header plus a type-tagged payload,
/// serialized as a single flat JSON object per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: NodeId,
    pub term: Term,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<Uuid>,
    #[serde(default = "default_room")]
    pub room_id: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Build an envelope, generating a `msg_id` for chat traffic.
    pub fn new(sender_id: NodeId, term: Term, payload: Payload) -> Self {
        let msg_id = match payload {
            Payload::Chat { .. } | Payload::SeqChat { .. } => Some(Uuid::new_v4()),
            _ => None,
        };
        Self {
            sender_id,
            term,
            msg_id,
            room_id: default_room(),
            payload,
        }
    }

    pub fn with_msg_id(mut self, msg_id: Uuid) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = room_id.into();
        self
    }

    pub fn message_type(&self) -> &'static str {
        self.payload.message_type()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "JOIN")]
    Join { peer: PeerInfo },
    #[serde(rename = "JOIN_ACK")]
    JoinAck {
        peers: Vec<PeerInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        leader_id: Option<NodeId>,
    },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "ELECTION")]
    Election,
    #[serde(rename = "ELECTION_OK")]
    ElectionOk,
    #[serde(rename = "COORDINATOR")]
    Coordinator { leader: PeerInfo },
    #[serde(rename = "CHAT")]
    Chat { payload: String },
    #[serde(rename = "SEQ_CHAT")]
    SeqChat {
        seq_no: SeqNo,
        payload: String,
        origin_sender_id: NodeId,
    },
    #[serde(rename = "CATCHUP_REQ")]
    CatchupReq { since_seq: SeqNo },
    #[serde(rename = "CATCHUP_RESP")]
    CatchupResp { messages: Vec<ChatRecord> },
}

impl Payload {
    pub fn message_type(&self) -> &'static str {
        match self {
            Payload::Join { .. } => "JOIN",
            Payload::JoinAck { .. } => "JOIN_ACK",
            Payload::Heartbeat => "HEARTBEAT",
            Payload::Election => "ELECTION",
            Payload::ElectionOk => "ELECTION_OK",
            Payload::Coordinator { .. } => "COORDINATOR",
            Payload::Chat { .. } => "CHAT",
            Payload::SeqChat { .. } => "SEQ_CHAT",
            Payload::CatchupReq { .. } => "CATCHUP_REQ",
            Payload::CatchupResp { .. } => "CATCHUP_RESP",
        }
    }
}

/// A delivered chat message. One JSON line per record in the message log;
/// also the unit shipped in CATCHUP_RESP batches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub seq_no: SeqNo,
    pub term: Term,
    /// Originating node, not whoever relayed the frame.
    pub sender_id: NodeId,
    pub msg_id: Uuid,
    #[serde(default = "default_room")]
    pub room_id: String,
    pub text: String,
    /// Unix milliseconds at delivery.
    pub ts: u64,
}

/// Wall clock in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips_flat_json() {
        let env = Envelope::new(
            NodeId::new(3),
            Term::new(2),
            Payload::SeqChat {
                seq_no: SeqNo::new(7),
                payload: "hello".to_string(),
                origin_sender_id: NodeId::new(1),
            },
        );
        let json = serde_json::to_string(&env).expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["type"], "SEQ_CHAT");
        assert_eq!(value["sender_id"], 3);
        assert_eq!(value["term"], 2);
        assert_eq!(value["seq_no"], 7);
        assert_eq!(value["room_id"], "general");
        assert_eq!(value["origin_sender_id"], 1);

        let decoded: Envelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, env);
    }

    #[test]
    fn control_messages_have_no_msg_id() {
        let env = Envelope::new(NodeId::new(1), Term::ZERO, Payload::Heartbeat);
        assert!(env.msg_id.is_none());
        let json = serde_json::to_string(&env).expect("serialize");
        assert!(!json.contains("msg_id"));
    }

    #[test]
    fn chat_messages_get_a_msg_id() {
        let env = Envelope::new(
            NodeId::new(1),
            Term::ZERO,
            Payload::Chat {
                payload: "hi".to_string(),
            },
        );
        assert!(env.msg_id.is_some());
    }

    #[test]
    fn room_id_defaults_when_absent() {
        let json = r#"{"type":"CHAT","sender_id":9,"term":0,"payload":"hey"}"#;
        let env: Envelope = serde_json::from_str(json).expect("deserialize");
        assert_eq!(env.room_id, DEFAULT_ROOM);
        assert_eq!(env.message_type(), "CHAT");
    }

    #[test]
    fn join_ack_omits_unknown_leader() {
        let env = Envelope::new(
            NodeId::new(2),
            Term::ZERO,
            Payload::JoinAck {
                peers: vec![PeerInfo::new(NodeId::new(2), "127.0.0.1", 7002)],
                leader_id: None,
            },
        );
        let json = serde_json::to_string(&env).expect("serialize");
        assert!(!json.contains("leader_id"));
    }
}
