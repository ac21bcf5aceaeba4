//! Node orchestrator state machine.
//!
//! Routes every inbound frame to the owning subsystem and drives role
//! transitions. Pure: handlers and the timer tick return [`Action`]s for
//! the runtime to execute, so protocol behavior is testable without
//! sockets or threads.

use std::fmt;

use uuid::Uuid;

use crate::config::{Config, Limits};
use crate::proto::{ChatRecord, Envelope, NodeId, Payload, PeerInfo, SeqNo, Term};

use super::election::{Election, ElectionTick};
use super::failure::{HeartbeatMonitor, HeartbeatSchedule};
use super::membership::Membership;
use super::metrics;
use super::ordering::{Ingest, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "FOLLOWER",
            Role::Candidate => "CANDIDATE",
            Role::Leader => "LEADER",
        };
        f.write_str(name)
    }
}

/// Side effects requested by the state machine, executed by the runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Send { to: PeerInfo, msg: Envelope },
    Broadcast { to: Vec<PeerInfo>, msg: Envelope },
    /// Persist and surface one delivered record. The runtime appends to
    /// the message log exactly once per delivery.
    Deliver(ChatRecord),
    /// Serve a catch-up request from storage: send every record with
    /// `seq_no > since_seq` to `to`, ascending, in batches.
    Catchup { to: PeerInfo, since_seq: SeqNo },
}

#[derive(Clone, Copy, Debug)]
struct Timing {
    heartbeat_interval_ms: u64,
    leader_timeout_ms: u64,
    election_timeout_ms: u64,
}

/// Capped exponential backoff for seed JOIN retries.
#[derive(Clone, Debug)]
struct Backoff {
    max_ms: u64,
    current_ms: u64,
}

impl Backoff {
    fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_ms,
            current_ms: base_ms,
        }
    }

    fn next_delay(&mut self) -> u64 {
        let delay = self.current_ms;
        self.current_ms = (self.current_ms * 2).min(self.max_ms);
        delay
    }
}

const JOIN_BACKOFF_BASE_MS: u64 = 500;
const JOIN_BACKOFF_MAX_MS: u64 = 5_000;

pub struct NodeState {
    membership: Membership,
    ordering: Ordering,
    election: Election,
    monitor: HeartbeatMonitor,
    heartbeat: HeartbeatSchedule,
    role: Role,
    current_term: Term,
    timing: Timing,
    /// True once any JOIN_ACK arrived; stops seed retries.
    joined: bool,
    join_backoff: Backoff,
    join_retry_at_ms: u64,
    /// Deadline for leader discovery after bootstrap; an election starts
    /// if nothing announced itself by then.
    discovery_deadline_ms: Option<u64>,
}

impl NodeState {
    pub fn new(config: &Config, now_ms: u64) -> Self {
        Self::with_limits(
            config.self_info(),
            config.seeds(),
            config.heartbeat_interval_ms,
            config.leader_timeout_ms,
            config.election_timeout_ms,
            &config.limits,
            now_ms,
        )
    }

    fn with_limits(
        self_info: PeerInfo,
        seeds: Vec<PeerInfo>,
        heartbeat_interval_ms: u64,
        leader_timeout_ms: u64,
        election_timeout_ms: u64,
        limits: &Limits,
        now_ms: u64,
    ) -> Self {
        Self {
            membership: Membership::new(self_info, seeds),
            ordering: Ordering::new(limits),
            election: Election::new(),
            monitor: HeartbeatMonitor::new(now_ms, leader_timeout_ms),
            heartbeat: HeartbeatSchedule::new(now_ms, heartbeat_interval_ms),
            role: Role::Follower,
            current_term: Term::ZERO,
            timing: Timing {
                heartbeat_interval_ms,
                leader_timeout_ms,
                election_timeout_ms,
            },
            joined: false,
            join_backoff: Backoff::new(JOIN_BACKOFF_BASE_MS, JOIN_BACKOFF_MAX_MS),
            join_retry_at_ms: 0,
            discovery_deadline_ms: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn last_seq(&self) -> SeqNo {
        self.ordering.last_seq()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.membership.leader_id()
    }

    pub fn self_id(&self) -> NodeId {
        self.membership.self_id()
    }

    /// Seed ordering state from a record recovered out of the log.
    pub fn recover_record(&mut self, seq_no: SeqNo, term: Term) {
        self.ordering.recover(seq_no, term);
    }

    /// Bootstrap: announce ourselves to every seed and arm the discovery
    /// deadline. With no seeds the node elects itself immediately.
    pub fn start(&mut self, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.membership.seeds().is_empty() {
            tracing::info!("no seed peers; holding a solo election");
            self.start_election(now_ms, &mut actions);
            return actions;
        }

        self.send_joins(now_ms, &mut actions);
        self.discovery_deadline_ms = Some(now_ms + self.timing.leader_timeout_ms);
        actions
    }

    fn send_joins(&mut self, now_ms: u64, actions: &mut Vec<Action>) {
        let join = Envelope::new(
            self.self_id(),
            self.current_term,
            Payload::Join {
                peer: self.membership.self_info().clone(),
            },
        );
        for seed in self.membership.seeds().to_vec() {
            tracing::info!("sending JOIN to seed {seed}");
            actions.push(Action::Send {
                to: seed,
                msg: join.clone(),
            });
        }
        self.join_retry_at_ms = now_ms + self.join_backoff.next_delay();
    }

    pub fn handle_message(&mut self, envelope: Envelope, now_ms: u64) -> Vec<Action> {
        tracing::debug!(
            from = envelope.sender_id.get(),
            term = envelope.term.get(),
            msg_type = envelope.message_type(),
            "inbound message"
        );

        let mut actions = Vec::new();
        match envelope.payload.clone() {
            Payload::Join { peer } => self.handle_join(peer, &mut actions),
            Payload::JoinAck { peers, leader_id } => {
                self.handle_join_ack(&envelope, peers, leader_id, now_ms, &mut actions)
            }
            Payload::Heartbeat => self.handle_heartbeat(&envelope, now_ms),
            Payload::Election => self.handle_election(&envelope, now_ms, &mut actions),
            Payload::ElectionOk => self.election.record_ok(),
            Payload::Coordinator { leader } => {
                self.handle_coordinator(leader, envelope.term, now_ms, &mut actions)
            }
            Payload::Chat { payload } => self.handle_chat(&envelope, payload, now_ms, &mut actions),
            Payload::SeqChat {
                seq_no,
                payload,
                origin_sender_id,
            } => self.handle_seq_chat(
                &envelope,
                seq_no,
                payload,
                origin_sender_id,
                now_ms,
                &mut actions,
            ),
            Payload::CatchupReq { since_seq } => {
                self.handle_catchup_req(&envelope, since_seq, &mut actions)
            }
            Payload::CatchupResp { messages } => self.handle_catchup_resp(messages, &mut actions),
        }
        actions
    }

    /// Periodic timer: join retries, leader heartbeats, the follower
    /// watchdog, and election deadlines.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();

        if !self.joined && !self.membership.seeds().is_empty() && now_ms >= self.join_retry_at_ms {
            self.send_joins(now_ms, &mut actions);
        }

        if let Some(deadline) = self.discovery_deadline_ms {
            if now_ms >= deadline {
                self.discovery_deadline_ms = None;
                if self.membership.leader_id().is_none() && !self.election.in_progress() {
                    tracing::info!("no leader discovered after bootstrap; starting election");
                    self.start_election(now_ms, &mut actions);
                }
            }
        }

        if self.role == Role::Leader && self.heartbeat.due(now_ms) {
            actions.push(Action::Broadcast {
                to: self.membership.others(),
                msg: Envelope::new(self.self_id(), self.current_term, Payload::Heartbeat),
            });
        }

        if self.role == Role::Follower && self.monitor.check(now_ms) {
            tracing::warn!(
                silent_ms = self.monitor.time_since_last(now_ms),
                "leader timed out; starting election"
            );
            self.start_election(now_ms, &mut actions);
        }

        match self.election.tick(now_ms, self.timing.election_timeout_ms) {
            ElectionTick::Victory(term) => self.become_leader(term, now_ms, &mut actions),
            ElectionTick::Restart => self.start_election(now_ms, &mut actions),
            ElectionTick::Idle | ElectionTick::AwaitCoordinator => {}
        }

        actions
    }

    /// A local client handed us a chat line; treat it like a CHAT frame
    /// from ourselves.
    pub fn submit_chat(&mut self, text: String, now_ms: u64) -> Vec<Action> {
        let envelope = Envelope::new(
            self.self_id(),
            self.current_term,
            Payload::Chat { payload: text },
        );
        self.handle_message(envelope, now_ms)
    }

    fn handle_join(&mut self, peer: PeerInfo, actions: &mut Vec<Action>) {
        tracing::info!("JOIN from {peer}");
        self.membership.add_or_update(peer.clone());

        let mut peers = self.membership.others();
        peers.push(self.membership.self_info().clone());
        actions.push(Action::Send {
            to: peer.clone(),
            msg: Envelope::new(
                self.self_id(),
                self.current_term,
                Payload::JoinAck {
                    peers,
                    leader_id: self.membership.leader_id(),
                },
            ),
        });

        // Make sure the joiner discovers the leader no matter which peer
        // it contacted first: the leader announces itself, and a follower
        // relays the announcement on the leader's behalf.
        let leader = if self.role == Role::Leader {
            Some(self.membership.self_info().clone())
        } else {
            self.membership
                .leader()
                .filter(|leader| leader.peer_id != peer.peer_id)
                .cloned()
        };
        if let Some(leader) = leader {
            actions.push(Action::Send {
                to: peer,
                msg: Envelope::new(
                    self.self_id(),
                    self.current_term,
                    Payload::Coordinator { leader },
                ),
            });
        }
    }

    fn handle_join_ack(
        &mut self,
        envelope: &Envelope,
        peers: Vec<PeerInfo>,
        leader_id: Option<NodeId>,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        tracing::info!(
            from = envelope.sender_id.get(),
            peers = peers.len(),
            "JOIN_ACK received"
        );
        self.membership.merge(&peers);
        self.joined = true;

        if envelope.term > self.current_term {
            self.current_term = envelope.term;
        }

        let Some(leader_id) = leader_id else {
            return;
        };
        if leader_id == self.self_id() || self.role == Role::Leader {
            // A sitting leader only steps down for a COORDINATOR.
            return;
        }
        if self.membership.peer(leader_id).is_some() {
            tracing::info!("JOIN_ACK names node_{leader_id} as leader");
            self.become_follower(leader_id, now_ms, actions);
        } else {
            tracing::warn!("JOIN_ACK names unknown leader node_{leader_id}");
        }
    }

    fn handle_heartbeat(&mut self, envelope: &Envelope, now_ms: u64) {
        if envelope.term < self.current_term {
            metrics::dropped("stale_term");
            return;
        }
        self.current_term = envelope.term;
        self.monitor.record(now_ms);

        if self.role == Role::Leader && envelope.sender_id != self.self_id() {
            tracing::warn!(
                from = envelope.sender_id.get(),
                "heartbeat from another leader; stepping down"
            );
            self.role = Role::Follower;
            self.monitor.reset(now_ms);
        }
        if self.membership.leader_id() != Some(envelope.sender_id) {
            if self.membership.peer(envelope.sender_id).is_some() {
                self.membership.set_leader(Some(envelope.sender_id));
            } else {
                tracing::debug!(
                    from = envelope.sender_id.get(),
                    "heartbeat from unknown peer"
                );
            }
        }
    }

    fn handle_election(&mut self, envelope: &Envelope, now_ms: u64, actions: &mut Vec<Action>) {
        if envelope.sender_id >= self.self_id() {
            tracing::debug!(
                from = envelope.sender_id.get(),
                "ELECTION from higher-priority peer; leaving it to them"
            );
            return;
        }

        tracing::info!(
            from = envelope.sender_id.get(),
            "ELECTION from lower-priority peer; answering OK"
        );
        if let Some(sender) = self.membership.peer(envelope.sender_id).cloned() {
            actions.push(Action::Send {
                to: sender,
                msg: Envelope::new(self.self_id(), self.current_term, Payload::ElectionOk),
            });
        }
        if !self.election.in_progress() {
            self.start_election(now_ms, actions);
        }
    }

    fn handle_coordinator(
        &mut self,
        leader: PeerInfo,
        term: Term,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        let already_leader_of_term =
            self.role == Role::Leader && term == self.current_term;
        if term < self.current_term || (term == self.current_term && already_leader_of_term) {
            metrics::dropped("stale_term");
            tracing::debug!(
                leader = leader.peer_id.get(),
                term = term.get(),
                "ignoring stale COORDINATOR"
            );
            return;
        }

        tracing::info!(term = term.get(), "COORDINATOR: leader is {leader}");
        self.current_term = term;
        self.membership.add_or_update(leader.clone());
        self.election.cancel();

        if leader.peer_id == self.self_id() {
            // Our own announcement echoed back; stay leader.
            self.membership.set_leader(Some(leader.peer_id));
            self.role = Role::Leader;
            return;
        }
        self.become_follower(leader.peer_id, now_ms, actions);
    }

    fn handle_chat(
        &mut self,
        envelope: &Envelope,
        text: String,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        if self.role != Role::Leader {
            match self.membership.leader().cloned() {
                Some(leader) if leader.peer_id != self.self_id() => {
                    tracing::debug!("forwarding CHAT to leader node_{}", leader.peer_id);
                    actions.push(Action::Send {
                        to: leader,
                        msg: envelope.clone(),
                    });
                }
                _ => {
                    metrics::dropped("no_leader");
                    tracing::warn!("no known leader to forward CHAT to; dropping");
                }
            }
            return;
        }

        // Leader path: assign the next slot in the total order, deliver
        // locally, and fan out.
        let record = ChatRecord {
            seq_no: self.ordering.next_expected(),
            term: self.current_term,
            sender_id: envelope.sender_id,
            msg_id: envelope.msg_id.unwrap_or_else(Uuid::new_v4),
            room_id: envelope.room_id.clone(),
            text,
            ts: now_ms,
        };
        tracing::info!(
            seq_no = record.seq_no.get(),
            origin = record.sender_id.get(),
            "assigned sequence number"
        );

        let seq_chat = Envelope::new(
            self.self_id(),
            self.current_term,
            Payload::SeqChat {
                seq_no: record.seq_no,
                payload: record.text.clone(),
                origin_sender_id: record.sender_id,
            },
        )
        .with_msg_id(record.msg_id)
        .with_room(record.room_id.clone());

        match self.ordering.ingest(record) {
            Ingest::Delivered(batch) => {
                actions.extend(batch.into_iter().map(Action::Deliver));
            }
            other => {
                // next_expected ingest cannot be refused.
                tracing::error!("leader self-delivery refused: {other:?}");
            }
        }
        actions.push(Action::Broadcast {
            to: self.membership.others(),
            msg: seq_chat,
        });
    }

    fn handle_seq_chat(
        &mut self,
        envelope: &Envelope,
        seq_no: SeqNo,
        text: String,
        origin_sender_id: NodeId,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        if envelope.term < self.current_term {
            metrics::dropped("stale_term");
            tracing::debug!(
                seq_no = seq_no.get(),
                term = envelope.term.get(),
                "SEQ_CHAT from stale leader ignored"
            );
            return;
        }
        if envelope.term > self.current_term {
            self.current_term = envelope.term;
            if self.role == Role::Leader {
                tracing::warn!("SEQ_CHAT at a higher term; stepping down");
                self.role = Role::Follower;
                self.monitor.reset(now_ms);
            }
            if self.membership.peer(envelope.sender_id).is_some() {
                self.membership.set_leader(Some(envelope.sender_id));
            }
        }

        let record = ChatRecord {
            seq_no,
            term: envelope.term,
            sender_id: origin_sender_id,
            msg_id: envelope.msg_id.unwrap_or_else(Uuid::new_v4),
            room_id: envelope.room_id.clone(),
            text,
            ts: now_ms,
        };
        if let Ingest::Delivered(batch) = self.ordering.ingest(record) {
            actions.extend(batch.into_iter().map(Action::Deliver));
        }
    }

    fn handle_catchup_req(
        &mut self,
        envelope: &Envelope,
        since_seq: SeqNo,
        actions: &mut Vec<Action>,
    ) {
        // Any node can serve catch-up: delivered records are identical
        // everywhere, and the requester may know a newer leader than we do.
        let Some(requester) = self.membership.peer(envelope.sender_id).cloned() else {
            tracing::warn!(
                from = envelope.sender_id.get(),
                "CATCHUP_REQ from unknown peer; dropping"
            );
            return;
        };
        tracing::info!(
            from = envelope.sender_id.get(),
            since = since_seq.get(),
            "serving catch-up"
        );
        actions.push(Action::Catchup {
            to: requester,
            since_seq,
        });
    }

    fn handle_catchup_resp(&mut self, messages: Vec<ChatRecord>, actions: &mut Vec<Action>) {
        let count = messages.len();
        for record in messages {
            if let Ingest::Delivered(batch) = self.ordering.ingest(record) {
                actions.extend(batch.into_iter().map(Action::Deliver));
            }
        }
        tracing::info!(
            records = count,
            last_seq = self.ordering.last_seq().get(),
            "catch-up batch applied"
        );
    }

    fn start_election(&mut self, now_ms: u64, actions: &mut Vec<Action>) {
        if self.election.in_progress() {
            return;
        }
        metrics::election_started();
        let candidate_term =
            self.election
                .start(self.current_term, now_ms, self.timing.election_timeout_ms);
        self.role = Role::Candidate;

        let election = Envelope::new(self.self_id(), candidate_term, Payload::Election);
        for peer in self.membership.higher_priority() {
            actions.push(Action::Send {
                to: peer,
                msg: election.clone(),
            });
        }
    }

    fn become_leader(&mut self, term: Term, now_ms: u64, actions: &mut Vec<Action>) {
        tracing::info!(term = term.get(), "became LEADER");
        self.role = Role::Leader;
        self.current_term = term;
        self.membership.set_leader(Some(self.self_id()));
        self.heartbeat.reset(now_ms);

        // Announce to every known peer; fall back to the seed list when
        // nobody has joined yet.
        let recipients = if self.membership.others().is_empty() {
            self.membership.seeds().to_vec()
        } else {
            self.membership.others()
        };
        actions.push(Action::Broadcast {
            to: recipients,
            msg: Envelope::new(
                self.self_id(),
                term,
                Payload::Coordinator {
                    leader: self.membership.self_info().clone(),
                },
            ),
        });
    }

    fn become_follower(&mut self, leader_id: NodeId, now_ms: u64, actions: &mut Vec<Action>) {
        let was = self.role;
        self.role = Role::Follower;
        self.membership.set_leader(Some(leader_id));
        self.monitor.reset(now_ms);
        if was != Role::Follower {
            tracing::info!(term = self.current_term.get(), "became FOLLOWER");
        }

        // Pull anything missed while we were away or electing.
        if let Some(leader) = self.membership.leader().cloned() {
            actions.push(Action::Send {
                to: leader,
                msg: Envelope::new(
                    self.self_id(),
                    self.current_term,
                    Payload::CatchupReq {
                        since_seq: self.ordering.last_seq(),
                    },
                ),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEARTBEAT_MS: u64 = 800;
    const LEADER_TIMEOUT_MS: u64 = 2500;
    const ELECTION_TIMEOUT_MS: u64 = 500;

    fn peer(id: u64) -> PeerInfo {
        PeerInfo::new(NodeId::new(id), "127.0.0.1", 7000 + id as u16)
    }

    fn state(self_id: u64, seeds: &[u64]) -> NodeState {
        NodeState::with_limits(
            peer(self_id),
            seeds.iter().map(|&id| peer(id)).collect(),
            HEARTBEAT_MS,
            LEADER_TIMEOUT_MS,
            ELECTION_TIMEOUT_MS,
            &Limits::default(),
            0,
        )
    }

    fn leader_state(self_id: u64, others: &[u64]) -> NodeState {
        let mut s = state(self_id, &[]);
        let _ = s.start(0);
        let _ = s.tick(ELECTION_TIMEOUT_MS);
        assert_eq!(s.role(), Role::Leader);
        for &id in others {
            s.membership.add_or_update(peer(id));
        }
        s
    }

    fn sent_types(actions: &[Action]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send { msg, .. } => Some(msg.message_type()),
                Action::Broadcast { msg, .. } => Some(msg.message_type()),
                _ => None,
            })
            .collect()
    }

    fn coordinator_from(leader_id: u64, term: u64) -> Envelope {
        Envelope::new(
            NodeId::new(leader_id),
            Term::new(term),
            Payload::Coordinator {
                leader: peer(leader_id),
            },
        )
    }

    fn seq_chat(sender: u64, term: u64, seq: u64, text: &str) -> Envelope {
        Envelope::new(
            NodeId::new(sender),
            Term::new(term),
            Payload::SeqChat {
                seq_no: SeqNo::new(seq),
                payload: text.to_string(),
                origin_sender_id: NodeId::new(sender),
            },
        )
    }

    #[test]
    fn election_with_no_higher_peers_wins_after_timeout() {
        let mut s = state(3, &[]);
        s.membership.add_or_update(peer(1));
        s.membership.add_or_update(peer(2));

        let mut actions = s.start(0);
        // No seeds: election starts immediately; no higher peers to ask.
        assert!(sent_types(&actions).is_empty());
        assert_eq!(s.role(), Role::Candidate);

        actions = s.tick(ELECTION_TIMEOUT_MS - 1);
        assert_eq!(s.role(), Role::Candidate);
        assert!(actions.is_empty());

        actions = s.tick(ELECTION_TIMEOUT_MS);
        assert_eq!(s.role(), Role::Leader);
        assert_eq!(s.current_term(), Term::new(1));
        let coordinator = actions
            .iter()
            .find_map(|action| match action {
                Action::Broadcast { to, msg } if msg.message_type() == "COORDINATOR" => {
                    Some((to.clone(), msg.clone()))
                }
                _ => None,
            })
            .expect("coordinator broadcast");
        let ids: Vec<u64> = coordinator.0.iter().map(|p| p.peer_id.get()).collect();
        assert_eq!(ids, vec![1, 2]);
        match coordinator.1.payload {
            Payload::Coordinator { ref leader } => assert_eq!(leader.peer_id, NodeId::new(3)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn election_asks_higher_peers_first() {
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(1));
        s.membership.add_or_update(peer(3));
        s.membership.add_or_update(peer(4));

        let actions = s.start(0);
        let targets: Vec<u64> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Send { to, msg } if msg.message_type() == "ELECTION" => {
                    Some(to.peer_id.get())
                }
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![3, 4]);
    }

    #[test]
    fn coordinator_cancels_election() {
        // A node that already conceded must not promote itself later.
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(3));
        let _ = s.start(0);
        assert_eq!(s.role(), Role::Candidate);
        let candidate_term = s.election.candidate_term();

        let actions = s.handle_message(coordinator_from(3, candidate_term.get()), 100);
        assert_eq!(s.role(), Role::Follower);
        assert_eq!(s.leader_id(), Some(NodeId::new(3)));
        assert!(!s.election.in_progress());
        // The fresh follower asks the leader for anything it missed.
        assert_eq!(sent_types(&actions), vec!["CATCHUP_REQ"]);

        // The old deadline must be inert (checked before the watchdog
        // would have any reason to fire).
        let actions = s.tick(2 * ELECTION_TIMEOUT_MS);
        assert_eq!(s.role(), Role::Follower);
        assert!(sent_types(&actions).is_empty());
    }

    #[test]
    fn stale_coordinator_is_ignored() {
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(3));
        let _ = s.handle_message(coordinator_from(3, 5), 0);
        assert_eq!(s.current_term(), Term::new(5));

        let _ = s.handle_message(coordinator_from(1, 4), 10);
        assert_eq!(s.leader_id(), Some(NodeId::new(3)));
        assert_eq!(s.current_term(), Term::new(5));
    }

    #[test]
    fn election_ok_defers_then_restarts() {
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(3));
        let _ = s.start(0);
        let _ = s.handle_message(
            Envelope::new(NodeId::new(3), Term::new(1), Payload::ElectionOk),
            100,
        );

        let actions = s.tick(ELECTION_TIMEOUT_MS);
        assert!(actions.is_empty());
        assert_eq!(s.role(), Role::Candidate);

        // No COORDINATOR within 2x the timeout: a fresh round begins.
        let actions = s.tick(3 * ELECTION_TIMEOUT_MS + 1);
        assert_eq!(sent_types(&actions), vec!["ELECTION"]);
    }

    #[test]
    fn election_from_lower_peer_gets_ok_and_counter_election() {
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(1));
        s.membership.add_or_update(peer(3));

        let actions = s.handle_message(
            Envelope::new(NodeId::new(1), Term::new(1), Payload::Election),
            0,
        );
        let types = sent_types(&actions);
        assert!(types.contains(&"ELECTION_OK"));
        assert!(types.contains(&"ELECTION"));
        assert!(s.election.in_progress());
    }

    #[test]
    fn election_from_higher_peer_is_left_alone() {
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(3));
        let actions = s.handle_message(
            Envelope::new(NodeId::new(3), Term::new(1), Payload::Election),
            0,
        );
        assert!(actions.is_empty());
        assert!(!s.election.in_progress());
    }

    #[test]
    fn leader_sequences_chat_and_broadcasts() {
        let mut s = leader_state(3, &[1, 2]);
        let actions = s.handle_message(
            Envelope::new(
                NodeId::new(1),
                Term::ZERO,
                Payload::Chat {
                    payload: "hello".to_string(),
                },
            ),
            1000,
        );

        let delivered: Vec<&ChatRecord> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Deliver(record) => Some(record),
                _ => None,
            })
            .collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].seq_no, SeqNo::new(1));
        assert_eq!(delivered[0].sender_id, NodeId::new(1));
        assert_eq!(delivered[0].term, s.current_term());

        let broadcast = actions
            .iter()
            .find_map(|action| match action {
                Action::Broadcast { msg, .. } if msg.message_type() == "SEQ_CHAT" => Some(msg),
                _ => None,
            })
            .expect("seq_chat broadcast");
        match &broadcast.payload {
            Payload::SeqChat {
                seq_no,
                origin_sender_id,
                ..
            } => {
                assert_eq!(*seq_no, SeqNo::new(1));
                assert_eq!(*origin_sender_id, NodeId::new(1));
            }
            _ => unreachable!(),
        }
        assert_eq!(s.last_seq(), SeqNo::new(1));
    }

    #[test]
    fn promoted_follower_continues_numbering() {
        // A follower that delivered 1..=5 must assign 6 when promoted.
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(3));
        let _ = s.handle_message(coordinator_from(3, 1), 0);
        for seq in 1..=5 {
            let _ = s.handle_message(seq_chat(3, 1, seq, "m"), 10);
        }
        assert_eq!(s.last_seq(), SeqNo::new(5));

        // Leader dies; node 2 wins an election.
        let _ = s.tick(LEADER_TIMEOUT_MS + 100);
        assert_eq!(s.role(), Role::Candidate);
        let _ = s.tick(LEADER_TIMEOUT_MS + 100 + ELECTION_TIMEOUT_MS);
        assert_eq!(s.role(), Role::Leader);
        assert_eq!(s.current_term(), Term::new(2));

        let actions = s.submit_chat("after failover".to_string(), 5000);
        let delivered = actions
            .iter()
            .find_map(|action| match action {
                Action::Deliver(record) => Some(record.clone()),
                _ => None,
            })
            .expect("delivery");
        assert_eq!(delivered.seq_no, SeqNo::new(6));
        assert_eq!(delivered.term, Term::new(2));
    }

    #[test]
    fn follower_forwards_chat_to_leader() {
        let mut s = state(1, &[]);
        s.membership.add_or_update(peer(3));
        let _ = s.handle_message(coordinator_from(3, 1), 0);

        let chat = Envelope::new(
            NodeId::new(1),
            Term::ZERO,
            Payload::Chat {
                payload: "hi".to_string(),
            },
        );
        let actions = s.handle_message(chat.clone(), 10);
        match &actions[..] {
            [Action::Send { to, msg }] => {
                assert_eq!(to.peer_id, NodeId::new(3));
                assert_eq!(msg, &chat);
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn chat_without_leader_is_dropped() {
        let mut s = state(1, &[]);
        let actions = s.submit_chat("lost".to_string(), 10);
        assert!(actions.is_empty());
    }

    #[test]
    fn stale_seq_chat_is_ignored() {
        let mut s = state(1, &[]);
        s.membership.add_or_update(peer(3));
        let _ = s.handle_message(coordinator_from(3, 2), 0);

        let actions = s.handle_message(seq_chat(2, 1, 1, "old leader"), 10);
        assert!(actions.is_empty());
        assert_eq!(s.last_seq(), SeqNo::ZERO);
    }

    #[test]
    fn higher_term_seq_chat_advances_term() {
        let mut s = state(1, &[]);
        s.membership.add_or_update(peer(3));
        let actions = s.handle_message(seq_chat(3, 4, 1, "new era"), 10);
        assert_eq!(s.current_term(), Term::new(4));
        assert_eq!(s.leader_id(), Some(NodeId::new(3)));
        assert!(matches!(actions[..], [Action::Deliver(_)]));
    }

    #[test]
    fn heartbeat_updates_watchdog_and_leader() {
        let mut s = state(1, &[]);
        s.membership.add_or_update(peer(3));
        let _ = s.handle_message(
            Envelope::new(NodeId::new(3), Term::new(2), Payload::Heartbeat),
            1000,
        );
        assert_eq!(s.current_term(), Term::new(2));
        assert_eq!(s.leader_id(), Some(NodeId::new(3)));

        // A fresh heartbeat keeps the watchdog quiet past the old deadline.
        let actions = s.tick(1000 + LEADER_TIMEOUT_MS);
        assert!(sent_types(&actions).is_empty());
        assert_eq!(s.role(), Role::Follower);
    }

    #[test]
    fn stale_heartbeat_is_dropped() {
        let mut s = state(1, &[]);
        s.membership.add_or_update(peer(2));
        s.membership.add_or_update(peer(3));
        let _ = s.handle_message(coordinator_from(3, 5), 0);
        let _ = s.handle_message(
            Envelope::new(NodeId::new(2), Term::new(3), Payload::Heartbeat),
            10,
        );
        assert_eq!(s.leader_id(), Some(NodeId::new(3)));
        assert_eq!(s.current_term(), Term::new(5));
    }

    #[test]
    fn join_gets_ack_and_leader_announcement() {
        let mut s = leader_state(3, &[]);
        let actions = s.handle_message(
            Envelope::new(
                NodeId::new(1),
                Term::ZERO,
                Payload::Join { peer: peer(1) },
            ),
            100,
        );
        assert_eq!(sent_types(&actions), vec!["JOIN_ACK", "COORDINATOR"]);
        match &actions[0] {
            Action::Send { to, msg } => {
                assert_eq!(to.peer_id, NodeId::new(1));
                match &msg.payload {
                    Payload::JoinAck { peers, leader_id } => {
                        assert_eq!(*leader_id, Some(NodeId::new(3)));
                        assert!(peers.iter().any(|p| p.peer_id == NodeId::new(3)));
                        assert!(peers.iter().any(|p| p.peer_id == NodeId::new(1)));
                    }
                    _ => panic!("expected JOIN_ACK"),
                }
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn follower_relays_coordinator_on_join() {
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(3));
        let _ = s.handle_message(coordinator_from(3, 1), 0);

        let actions = s.handle_message(
            Envelope::new(
                NodeId::new(1),
                Term::ZERO,
                Payload::Join { peer: peer(1) },
            ),
            100,
        );
        let types = sent_types(&actions);
        assert_eq!(types, vec!["JOIN_ACK", "COORDINATOR"]);
        let relayed = actions
            .iter()
            .find_map(|action| match action {
                Action::Send { to, msg } if msg.message_type() == "COORDINATOR" => {
                    Some((to.clone(), msg.clone()))
                }
                _ => None,
            })
            .expect("relayed coordinator");
        assert_eq!(relayed.0.peer_id, NodeId::new(1));
        match relayed.1.payload {
            Payload::Coordinator { ref leader } => assert_eq!(leader.peer_id, NodeId::new(3)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn join_ack_with_leader_enters_follower_and_catches_up() {
        let mut s = state(1, &[2]);
        let _ = s.start(0);
        let actions = s.handle_message(
            Envelope::new(
                NodeId::new(2),
                Term::new(3),
                Payload::JoinAck {
                    peers: vec![peer(2), peer(3)],
                    leader_id: Some(NodeId::new(3)),
                },
            ),
            100,
        );
        assert_eq!(s.role(), Role::Follower);
        assert_eq!(s.leader_id(), Some(NodeId::new(3)));
        assert_eq!(s.current_term(), Term::new(3));
        let catchup = actions
            .iter()
            .find_map(|action| match action {
                Action::Send { to, msg } if msg.message_type() == "CATCHUP_REQ" => {
                    Some(to.clone())
                }
                _ => None,
            })
            .expect("catch-up request");
        assert_eq!(catchup.peer_id, NodeId::new(3));
    }

    #[test]
    fn bootstrap_retries_seeds_then_elects() {
        let mut s = state(1, &[2, 3]);
        let actions = s.start(0);
        assert_eq!(sent_types(&actions), vec!["JOIN", "JOIN"]);

        // First retry fires on the backoff schedule.
        let actions = s.tick(JOIN_BACKOFF_BASE_MS);
        assert_eq!(sent_types(&actions), vec!["JOIN", "JOIN"]);

        // Discovery deadline passes with silence: an election begins.
        let actions = s.tick(LEADER_TIMEOUT_MS);
        let types = sent_types(&actions);
        assert!(types.contains(&"ELECTION") || s.election.in_progress());
        assert_eq!(s.role(), Role::Candidate);
    }

    #[test]
    fn catchup_req_is_served_from_any_role() {
        let mut s = state(2, &[]);
        s.membership.add_or_update(peer(1));
        let actions = s.handle_message(
            Envelope::new(
                NodeId::new(1),
                Term::ZERO,
                Payload::CatchupReq {
                    since_seq: SeqNo::new(3),
                },
            ),
            0,
        );
        match &actions[..] {
            [Action::Catchup { to, since_seq }] => {
                assert_eq!(to.peer_id, NodeId::new(1));
                assert_eq!(*since_seq, SeqNo::new(3));
            }
            other => panic!("expected catch-up action, got {other:?}"),
        }
    }

    #[test]
    fn catchup_resp_flows_through_delivery() {
        let mut s = state(1, &[]);
        s.recover_record(SeqNo::new(1), Term::new(1));

        let records: Vec<ChatRecord> = (2..=4)
            .map(|seq| ChatRecord {
                seq_no: SeqNo::new(seq),
                term: Term::new(1),
                sender_id: NodeId::new(3),
                msg_id: Uuid::new_v4(),
                room_id: "general".to_string(),
                text: format!("m{seq}"),
                ts: 0,
            })
            .collect();
        let actions = s.handle_message(
            Envelope::new(
                NodeId::new(3),
                Term::new(1),
                Payload::CatchupResp { messages: records },
            ),
            100,
        );
        let delivered: Vec<u64> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Deliver(record) => Some(record.seq_no.get()),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![2, 3, 4]);
        assert_eq!(s.last_seq(), SeqNo::new(4));
    }

    #[test]
    fn recovery_seeds_last_seq() {
        let mut s = state(1, &[]);
        s.recover_record(SeqNo::new(7), Term::new(2));
        assert_eq!(s.last_seq(), SeqNo::new(7));
        // A replayed record is deduplicated, not redelivered.
        let actions = s.handle_message(seq_chat(3, 2, 7, "replay"), 10);
        assert!(actions.is_empty());
    }

    #[test]
    fn leader_emits_heartbeats_on_schedule() {
        let mut s = leader_state(3, &[1, 2]);
        let actions = s.tick(ELECTION_TIMEOUT_MS + HEARTBEAT_MS);
        let heartbeat = actions
            .iter()
            .find_map(|action| match action {
                Action::Broadcast { to, msg } if msg.message_type() == "HEARTBEAT" => Some(to),
                _ => None,
            })
            .expect("heartbeat broadcast");
        assert_eq!(heartbeat.len(), 2);
    }
}
