use tokio::sync::oneshot;
// Use external log crate, not our own log module
use ::log::debug;

use super::{LogEntry, RaftError, RaftNode};

/// The application collaborator. Committed entries are handed to it one at
/// a time in index order. It must be deterministic; after a restart it may
/// see entries it has already applied.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry) -> Result<Vec<u8>, RaftError>;
}

impl<F> StateMachine for F
where
    F: FnMut(&LogEntry) -> Result<Vec<u8>, RaftError> + Send + 'static,
{
    fn apply(&mut self, entry: &LogEntry) -> Result<Vec<u8>, RaftError> {
        self(entry)
    }
}

/// Handle for a command accepted by the leader.
#[derive(Debug)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
    rx: oneshot::Receiver<Vec<u8>>,
}

impl Proposal {
    pub(crate) fn new(index: u64, term: u64, rx: oneshot::Receiver<Vec<u8>>) -> Self {
        Self { index, term, rx }
    }

    /// Waits for the state machine output of this entry. Resolves to
    /// `NotCommitted` if the leader lost its leadership first; the entry may
    /// still be committed later by another leader.
    pub async fn wait(self) -> Result<Vec<u8>, RaftError> {
        let index = self.index;
        self.rx
            .await
            .map_err(|_| RaftError::NotCommitted { index })
    }
}

impl RaftNode {
    /// Committed entries not yet handed to the state machine, in index order.
    pub fn entries_to_apply(&self) -> Vec<LogEntry> {
        let next = self.state.last_applied() + 1;
        self.state.log.range(next, self.state.commit_index())
    }

    /// Records that `entry` was applied and hands `output` to the proposer
    /// if it is still waiting for exactly this entry.
    pub fn complete_apply(&mut self, entry: &LogEntry, output: Vec<u8>) -> Result<(), RaftError> {
        if entry.index != self.state.last_applied + 1 || entry.index > self.state.commit_index {
            return Err(RaftError::SafetyViolation(format!(
                "out-of-order apply of index {} (last applied {}, commit {})",
                entry.index, self.state.last_applied, self.state.commit_index
            )));
        }

        self.state.last_applied = entry.index;
        debug!(
            "Node {} applied log entry {} (term {})",
            self.id, entry.index, entry.term
        );

        if let Some(pending) = self.pending_commands.remove(&entry.index) {
            if pending.term == entry.term {
                let _ = pending.tx.send(output);
            }
        }

        Ok(())
    }
}
