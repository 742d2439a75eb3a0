//! RPC payloads exchanged between nodes, and the client requests carried on
//! the same wire.

use serde::{Deserialize, Serialize};

use super::{LogEntry, NodeId, RaftStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// Index of the last entry this request covers.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success, the last index known to match the leader.
    pub match_index: u64,
    /// On a log mismatch, where the leader should resume from.
    pub conflict_index: Option<u64>,
    /// On a term mismatch at `prev_log_index`, the follower's term there.
    pub conflict_term: Option<u64>,
}

impl AppendEntriesResponse {
    pub(crate) fn stale(term: u64) -> Self {
        Self {
            term,
            success: false,
            match_index: 0,
            conflict_index: None,
            conflict_term: None,
        }
    }
}

/// A frame sent to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    Submit { command: Vec<u8> },
    Status,
}

/// A frame sent back for an [`RpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    Applied { index: u64, output: Vec<u8> },
    NotLeader { leader: Option<NodeId> },
    Status(RaftStatus),
    Error(String),
}
