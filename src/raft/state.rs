use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Log, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "Follower"),
            NodeRole::Candidate => write!(f, "Candidate"),
            NodeRole::Leader => write!(f, "Leader"),
        }
    }
}

/// The durable part of the state besides the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// The state store of one node. Every method is meant to run while the
/// owning node's lock is held; none of them fail.
#[derive(Debug)]
pub struct RaftState {
    role: NodeRole,

    // persistent
    current_term: u64,
    voted_for: Option<NodeId>,
    pub(crate) log: Log,

    // volatile
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,

    // volatile, leader only
    pub(crate) next_index: HashMap<NodeId, u64>,
    pub(crate) match_index: HashMap<NodeId, u64>,
}

impl RaftState {
    /// Restores persisted fields; volatile fields start zeroed and the node starts as a follower.
    pub fn new(hard_state: HardState, log: Log) -> Self {
        Self {
            role: NodeRole::Follower,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn next_index(&self, peer: &str) -> Option<u64> {
        self.next_index.get(peer).copied()
    }

    pub fn match_index(&self, peer: &str) -> Option<u64> {
        self.match_index.get(peer).copied()
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }

    /// `(index, term)` of the last entry, or `(0, 0)` for an empty log.
    pub fn last_log(&self) -> (u64, u64) {
        (self.log.last_index(), self.log.last_term())
    }

    /// Steps down. A higher `term` is adopted and clears the vote; a lower
    /// or equal one only changes the role.
    pub fn become_follower(&mut self, term: u64) {
        self.role = NodeRole::Follower;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
    }

    /// Only flips the role; the caller has already run `vote_for_self`.
    pub fn become_candidate(&mut self) {
        self.role = NodeRole::Candidate;
    }

    /// Starts a new election epoch: bumps the term and votes for `self_id`.
    pub fn vote_for_self(&mut self, self_id: &str) {
        self.current_term += 1;
        self.voted_for = Some(self_id.to_string());
    }

    /// Records a vote for another candidate in the current term. Never touches the term.
    pub fn vote_for(&mut self, peer: &str) {
        self.voted_for = Some(peer.to_string());
    }

    pub fn become_leader(&mut self, peers: &[NodeId]) {
        self.role = NodeRole::Leader;
        let next = self.log.last_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer.clone(), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RaftState {
        RaftState::new(HardState::default(), Log::new())
    }

    #[test]
    fn starts_as_follower_with_zeroed_volatile_state() {
        let mut log = Log::new();
        log.append(3, b"x".to_vec());
        let s = RaftState::new(
            HardState {
                current_term: 3,
                voted_for: Some("n2".into()),
            },
            log,
        );
        assert_eq!(s.role(), NodeRole::Follower);
        assert_eq!(s.current_term(), 3);
        assert_eq!(s.voted_for().map(String::as_str), Some("n2"));
        assert_eq!(s.commit_index(), 0);
        assert_eq!(s.last_applied(), 0);
        assert_eq!(s.last_log(), (1, 3));
    }

    #[test]
    fn become_follower_adopts_higher_term_and_clears_vote() {
        let mut s = state();
        s.vote_for_self("n1");
        s.become_candidate();
        assert_eq!(s.current_term(), 1);

        s.become_follower(4);
        assert_eq!(s.role(), NodeRole::Follower);
        assert_eq!(s.current_term(), 4);
        assert!(s.voted_for().is_none());
    }

    #[test]
    fn become_follower_never_regresses_term() {
        let mut s = state();
        s.become_follower(5);
        s.vote_for("n3");
        s.become_follower(2);
        assert_eq!(s.current_term(), 5);
        assert_eq!(s.voted_for().map(String::as_str), Some("n3"));
        s.become_follower(5);
        assert_eq!(s.voted_for().map(String::as_str), Some("n3"));
    }

    #[test]
    fn vote_for_self_bumps_term_but_vote_for_peer_does_not() {
        let mut s = state();
        s.vote_for_self("n1");
        assert_eq!(s.current_term(), 1);
        assert_eq!(s.voted_for().map(String::as_str), Some("n1"));

        let mut s = state();
        s.become_follower(7);
        s.vote_for("n2");
        assert_eq!(s.current_term(), 7);
        assert_eq!(s.voted_for().map(String::as_str), Some("n2"));
    }

    #[test]
    fn become_leader_reinitializes_peer_progress() {
        let mut s = state();
        s.log.append(1, vec![]);
        s.log.append(1, vec![]);
        s.match_index.insert("stale".into(), 9);
        let peers = vec!["n2".to_string(), "n3".to_string()];
        s.become_leader(&peers);
        assert_eq!(s.role(), NodeRole::Leader);
        assert_eq!(s.next_index("n2"), Some(3));
        assert_eq!(s.match_index("n3"), Some(0));
        assert_eq!(s.match_index("stale"), None);
    }
}
