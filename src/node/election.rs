//! Priority ("bully") leader election state machine.
//!
//! Pure deadline-driven state: the orchestrator calls `tick` from its
//! periodic timer and re-checks phase after every message, so a node that
//! accepted a higher COORDINATOR can never promote itself afterwards.

use crate::proto::Term;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// ELECTION sent to higher-priority peers; waiting for ELECTION_OK.
    Waiting { deadline_ms: u64 },
    /// A higher-priority peer answered; waiting for its COORDINATOR.
    AwaitingCoordinator { deadline_ms: u64 },
}

/// Outcome of an election timer check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionTick {
    Idle,
    /// No higher-priority peer objected within the timeout: become leader
    /// at the candidate term.
    Victory(Term),
    /// OK received; now waiting out the secondary timer.
    AwaitCoordinator,
    /// The promised COORDINATOR never arrived: run a fresh election.
    Restart,
}

#[derive(Clone, Debug)]
pub struct Election {
    phase: Phase,
    ok_received: bool,
    candidate_term: Term,
}

impl Election {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            ok_received: false,
            candidate_term: Term::ZERO,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn candidate_term(&self) -> Term {
        self.candidate_term
    }

    /// Begin an election at `current_term + 1`. Caller sends ELECTION to
    /// every higher-priority peer. Returns the candidate term.
    pub fn start(&mut self, current_term: Term, now_ms: u64, timeout_ms: u64) -> Term {
        debug_assert!(!self.in_progress());
        self.candidate_term = current_term.next();
        self.ok_received = false;
        self.phase = Phase::Waiting {
            deadline_ms: now_ms + timeout_ms,
        };
        tracing::info!(term = self.candidate_term.get(), "starting election");
        self.candidate_term
    }

    pub fn record_ok(&mut self) {
        if self.in_progress() {
            self.ok_received = true;
        }
    }

    /// Cancel on accepting a COORDINATOR. The pending deadline becomes
    /// inert; no victory can fire after this.
    pub fn cancel(&mut self) {
        if self.in_progress() {
            tracing::debug!("election cancelled");
        }
        self.phase = Phase::Idle;
        self.ok_received = false;
    }

    pub fn tick(&mut self, now_ms: u64, timeout_ms: u64) -> ElectionTick {
        match self.phase {
            Phase::Waiting { deadline_ms } if now_ms >= deadline_ms => {
                if self.ok_received {
                    self.phase = Phase::AwaitingCoordinator {
                        deadline_ms: now_ms + 2 * timeout_ms,
                    };
                    tracing::debug!("outranked; awaiting COORDINATOR");
                    ElectionTick::AwaitCoordinator
                } else {
                    self.phase = Phase::Idle;
                    tracing::info!(term = self.candidate_term.get(), "election won");
                    ElectionTick::Victory(self.candidate_term)
                }
            }
            Phase::AwaitingCoordinator { deadline_ms } if now_ms >= deadline_ms => {
                self.phase = Phase::Idle;
                tracing::warn!("no COORDINATOR arrived; restarting election");
                ElectionTick::Restart
            }
            _ => ElectionTick::Idle,
        }
    }
}

impl Default for Election {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: u64 = 500;

    #[test]
    fn victory_without_objection() {
        let mut e = Election::new();
        let term = e.start(Term::new(3), 1000, TIMEOUT);
        assert_eq!(term, Term::new(4));
        assert!(e.in_progress());

        assert_eq!(e.tick(1400, TIMEOUT), ElectionTick::Idle);
        assert_eq!(e.tick(1500, TIMEOUT), ElectionTick::Victory(Term::new(4)));
        assert!(!e.in_progress());
    }

    #[test]
    fn ok_defers_to_higher_peer() {
        let mut e = Election::new();
        e.start(Term::ZERO, 0, TIMEOUT);
        e.record_ok();

        assert_eq!(e.tick(TIMEOUT, TIMEOUT), ElectionTick::AwaitCoordinator);
        assert!(e.in_progress());
        // Secondary timer is twice the election timeout.
        assert_eq!(e.tick(TIMEOUT + 999, TIMEOUT), ElectionTick::Idle);
        assert_eq!(e.tick(TIMEOUT + 1500, TIMEOUT), ElectionTick::Restart);
        assert!(!e.in_progress());
    }

    #[test]
    fn cancellation_prevents_victory() {
        let mut e = Election::new();
        e.start(Term::new(1), 0, TIMEOUT);
        e.cancel();
        assert!(!e.in_progress());
        assert_eq!(e.tick(10_000, TIMEOUT), ElectionTick::Idle);
    }

    #[test]
    fn ok_after_cancel_is_ignored() {
        let mut e = Election::new();
        e.start(Term::new(1), 0, TIMEOUT);
        e.cancel();
        e.record_ok();
        e.start(Term::new(1), 0, TIMEOUT);
        // The stale OK must not leak into the new round.
        assert_eq!(e.tick(TIMEOUT, TIMEOUT), ElectionTick::Victory(Term::new(2)));
    }

    #[test]
    fn candidate_term_increments_current() {
        let mut e = Election::new();
        assert_eq!(e.start(Term::new(7), 0, TIMEOUT), Term::new(8));
    }
}
