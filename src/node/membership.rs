//! Cluster membership: peer map, leader tracking, seed bootstrap set.

use std::collections::BTreeMap;

use crate::proto::{NodeId, PeerInfo};

/// The local view of the cluster. `peers` never contains this node; the
/// leader, when known, is either a peer or this node itself.
#[derive(Clone, Debug)]
pub struct Membership {
    self_info: PeerInfo,
    peers: BTreeMap<NodeId, PeerInfo>,
    leader_id: Option<NodeId>,
    seeds: Vec<PeerInfo>,
}

impl Membership {
    pub fn new(self_info: PeerInfo, seeds: Vec<PeerInfo>) -> Self {
        let self_id = self_info.peer_id;
        Self {
            self_info,
            peers: BTreeMap::new(),
            leader_id: None,
            seeds: seeds
                .into_iter()
                .filter(|seed| seed.peer_id != self_id)
                .collect(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_info.peer_id
    }

    pub fn self_info(&self) -> &PeerInfo {
        &self.self_info
    }

    pub fn seeds(&self) -> &[PeerInfo] {
        &self.seeds
    }

    /// Upsert a peer. Returns true when the peer was not known before.
    pub fn add_or_update(&mut self, peer: PeerInfo) -> bool {
        if peer.peer_id == self.self_id() {
            return false;
        }
        let known = self.peers.insert(peer.peer_id, peer.clone()).is_some();
        if !known {
            tracing::info!("added peer {peer}");
        }
        !known
    }

    /// Remove a peer on explicit exit. Transient unreachability does not
    /// remove peers; heartbeats and elections heal that.
    pub fn remove(&mut self, peer_id: NodeId) {
        if self.peers.remove(&peer_id).is_some() {
            tracing::info!("removed peer node_{peer_id}");
            if self.leader_id == Some(peer_id) {
                self.leader_id = None;
            }
        }
    }

    pub fn merge(&mut self, peers: &[PeerInfo]) {
        for peer in peers {
            self.add_or_update(peer.clone());
        }
    }

    pub fn peer(&self, peer_id: NodeId) -> Option<&PeerInfo> {
        if peer_id == self.self_id() {
            Some(&self.self_info)
        } else {
            self.peers.get(&peer_id)
        }
    }

    /// Every known peer except this node.
    pub fn others(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }

    /// Peers that outrank this node in an election.
    pub fn higher_priority(&self) -> Vec<PeerInfo> {
        self.peers
            .values()
            .filter(|peer| peer.peer_id > self.self_id())
            .cloned()
            .collect()
    }

    pub fn set_leader(&mut self, leader_id: Option<NodeId>) {
        if self.leader_id != leader_id {
            match leader_id {
                Some(id) => tracing::info!("leader set to node_{id}"),
                None => tracing::info!("leader cleared"),
            }
        }
        self.leader_id = leader_id;
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn leader(&self) -> Option<&PeerInfo> {
        self.leader_id.and_then(|id| self.peer(id))
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id == Some(self.self_id())
    }
}
