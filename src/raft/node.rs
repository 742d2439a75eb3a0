use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
// Use external log crate, not our own log module
use ::log::{debug, error, info};

use super::{Log, NodeId, NodeRole, RaftConfig, RaftError, RaftState, Storage};

/// A point-in-time view of a node, safe to hand out after the lock is released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: NodeRole,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub halted: bool,
}

pub(crate) struct PendingCommand {
    pub(crate) term: u64,
    pub(crate) tx: oneshot::Sender<Vec<u8>>,
}

/// The consensus actor of one node: the state store plus everything the
/// election, replication and apply paths need. It does no I/O besides the
/// storage collaborator; callers serialize access to it behind one lock.
pub struct RaftNode {
    // Node identity
    pub(crate) id: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) config: RaftConfig,

    // Raft state
    pub(crate) state: RaftState,
    storage: Box<dyn Storage>,
    pub(crate) leader_id: Option<NodeId>,

    // Election state
    pub(crate) election_deadline: Instant,
    pub(crate) votes_received: HashSet<NodeId>,

    // For the current leader: log index -> waiter notified once the entry is applied.
    pub(crate) pending_commands: HashMap<u64, PendingCommand>,

    halted: bool,
}

impl RaftNode {
    pub fn new(config: RaftConfig, storage: Box<dyn Storage>) -> Result<Self, RaftError> {
        config.validate()?;

        let persisted = storage.load()?;
        let log = Log::from_entries(persisted.entries)?;
        let state = RaftState::new(persisted.hard_state, log);

        info!(
            "Node {} starting at term {} with {} log entries",
            config.node_id,
            state.current_term(),
            state.log().len()
        );

        let mut node = Self {
            id: config.node_id.clone(),
            peers: config.peer_ids(),
            config,
            state,
            storage,
            leader_id: None,
            election_deadline: Instant::now(),
            votes_received: HashSet::new(),
            pending_commands: HashMap::new(),
            halted: false,
        };
        node.reset_election_timer();

        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn state(&self) -> &RaftState {
        &self.state
    }

    pub fn role(&self) -> NodeRole {
        self.state.role()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state.role(), NodeRole::Leader)
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn quorum(&self) -> usize {
        self.config.quorum()
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Stops the node from taking part in the protocol. Irreversible.
    pub fn halt(&mut self) {
        if !self.halted {
            error!("Node {} halted in term {}", self.id, self.state.current_term());
        }
        self.halted = true;
        self.abort_pending_commands();
    }

    pub fn status(&self) -> RaftStatus {
        let (last_log_index, last_log_term) = self.state.last_log();
        RaftStatus {
            id: self.id.clone(),
            role: self.state.role(),
            current_term: self.state.current_term(),
            voted_for: self.state.voted_for().cloned(),
            leader_id: self.leader_id.clone(),
            commit_index: self.state.commit_index(),
            last_applied: self.state.last_applied(),
            last_log_index,
            last_log_term,
            halted: self.halted,
        }
    }

    pub fn random_election_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        let timeout_ms =
            rng.random_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    /// Pushes the election deadline out by a fresh randomized timeout.
    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.random_election_timeout();
    }

    pub(crate) fn persist(&mut self) -> Result<(), RaftError> {
        let hard_state = self.state.hard_state();
        self.storage.persist(&hard_state, self.state.log.entries())
    }

    /// Becomes a follower, adopting `term` if it is newer. Durable before returning.
    pub(crate) fn step_down(&mut self, term: u64) -> Result<(), RaftError> {
        let old_term = self.state.current_term();
        let old_role = self.state.role();

        self.state.become_follower(term);
        self.votes_received.clear();

        if self.state.current_term() > old_term {
            self.leader_id = None;
            self.persist()?;
        }
        if old_role != NodeRole::Follower {
            info!(
                "Node {} stepping down from {} to follower in term {}",
                self.id,
                old_role,
                self.state.current_term()
            );
            self.abort_pending_commands();
            self.reset_election_timer();
        } else if self.state.current_term() > old_term {
            debug!(
                "Node {} adopted term {} (was {})",
                self.id,
                self.state.current_term(),
                old_term
            );
        }

        Ok(())
    }

    fn abort_pending_commands(&mut self) {
        // Dropping the senders makes any awaiting proposal observe NotCommitted
        // instead of hanging forever.
        self.pending_commands.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::raft::{HardState, LogEntry, MemStorage};

    pub(crate) fn config(id: &str, peers: &[&str]) -> RaftConfig {
        let mut cfg = RaftConfig::new(id, "unused");
        for peer in peers {
            cfg.add_peer(peer, "local");
        }
        cfg
    }

    pub(crate) fn node(id: &str, peers: &[&str]) -> RaftNode {
        RaftNode::new(config(id, peers), Box::new(MemStorage::new())).expect("node")
    }

    #[test]
    fn new_node_is_follower_with_deadline_in_range() {
        let before = Instant::now();
        let node = node("n1", &["n2", "n3"]);
        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.state().current_term(), 0);
        assert!(node.leader_id().is_none());
        let deadline = node.election_deadline();
        assert!(deadline >= before + Duration::from_millis(150));
        assert!(deadline <= Instant::now() + Duration::from_millis(300));
    }

    #[test]
    fn new_node_restores_persisted_record() {
        let mut storage = MemStorage::new();
        storage
            .persist(
                &HardState {
                    current_term: 6,
                    voted_for: Some("n3".into()),
                },
                &[LogEntry {
                    index: 1,
                    term: 5,
                    command: b"a".to_vec(),
                }],
            )
            .expect("persist");

        let node = RaftNode::new(config("n1", &["n2", "n3"]), Box::new(storage)).expect("node");
        let status = node.status();
        assert_eq!(status.current_term, 6);
        assert_eq!(status.voted_for.as_deref(), Some("n3"));
        assert_eq!((status.last_log_index, status.last_log_term), (1, 5));
        assert_eq!(status.commit_index, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config("n1", &["n2"]);
        cfg.heartbeat_interval = 500;
        assert!(matches!(
            RaftNode::new(cfg, Box::new(MemStorage::new())),
            Err(RaftError::Config(_))
        ));
    }

    #[tokio::test]
    async fn halt_cancels_pending_waiters() {
        let mut node = node("n1", &[]);
        let (tx, rx) = oneshot::channel::<Vec<u8>>();
        node.pending_commands
            .insert(1, PendingCommand { term: 1, tx });

        node.halt();

        assert!(node.is_halted());
        assert!(rx.await.is_err());
    }

    #[test]
    fn step_down_persists_new_term() {
        let storage = MemStorage::new();
        let mut node =
            RaftNode::new(config("n1", &["n2"]), Box::new(storage.clone())).expect("node");
        node.step_down(3).expect("step down");
        assert_eq!(storage.load().expect("load").hard_state.current_term, 3);
    }
}
