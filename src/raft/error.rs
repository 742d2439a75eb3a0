use thiserror::Error;

use super::NodeId;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not a leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("Entry at index {index} was not committed by this leader")]
    NotCommitted { index: u64 },

    #[error("Node is halted")]
    Halted,

    #[error("Invalid log index: {0}")]
    InvalidLogIndex(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State machine error: {0}")]
    StateMachine(String),

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Timeout")]
    Timeout,
}

impl RaftError {
    /// Errors after which the node must stop participating in the protocol.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Storage(_)
                | RaftError::Io(_)
                | RaftError::Serialization(_)
                | RaftError::StateMachine(_)
                | RaftError::SafetyViolation(_)
        )
    }
}
