use tokio::sync::oneshot;
// Use external log crate, not our own log module
use ::log::{debug, info, warn};

use super::node::PendingCommand;
use super::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, NodeId, NodeRole, Proposal, RaftError,
    RaftNode,
};

/// What the leader should do after processing one AppendEntries reply.
#[derive(Debug, Default)]
pub struct ReplicationOutcome {
    pub commit_advanced: bool,
    /// A request to send to the same peer right away.
    pub follow_up: Option<AppendEntriesRequest>,
}

impl RaftNode {
    /// Appends a client command to the leader's log.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader: self.leader_id.clone(),
            });
        }

        let term = self.state.current_term();
        let index = self.state.log.append(term, command);
        self.persist()?;

        let (tx, rx) = oneshot::channel();
        self.pending_commands
            .insert(index, PendingCommand { term, tx });
        debug!("Node {} appended entry {} in term {}", self.id, index, term);

        // A single-node cluster commits on its own log.
        self.advance_commit_index();

        Ok(Proposal::new(index, term, rx))
    }

    /// One AppendEntries per peer, reflecting each peer's `next_index`.
    pub fn append_requests(&self) -> Vec<(NodeId, AppendEntriesRequest)> {
        self.peers
            .iter()
            .filter_map(|peer| {
                self.append_request_for(peer)
                    .map(|request| (peer.clone(), request))
            })
            .collect()
    }

    pub fn append_request_for(&self, peer: &str) -> Option<AppendEntriesRequest> {
        if !self.is_leader() {
            return None;
        }

        let next_index = self.state.next_index(peer)?;
        let prev_log_index = next_index - 1;
        let prev_log_term = self.state.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .state
            .log
            .entries_from(next_index, self.config.max_entries_per_append);

        Some(AppendEntriesRequest {
            term: self.state.current_term(),
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.commit_index(),
        })
    }

    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        // Reply false if term < currentTerm
        if request.term < self.state.current_term() {
            debug!(
                "Node {} rejecting AppendEntries from {} with stale term {} (current {})",
                self.id,
                request.leader_id,
                request.term,
                self.state.current_term()
            );
            return Ok(AppendEntriesResponse::stale(self.state.current_term()));
        }

        // A valid leader exists for this term; candidates and stale leaders yield.
        if request.term > self.state.current_term() || self.state.role() != NodeRole::Follower {
            self.step_down(request.term)?;
        }
        self.leader_id = Some(request.leader_id.clone());
        self.reset_election_timer();

        let term = self.state.current_term();
        let last_index = self.state.log.last_index();

        if request.prev_log_index > last_index {
            debug!(
                "Node {} log too short for prev_log_index {} (last index {})",
                self.id, request.prev_log_index, last_index
            );
            return Ok(AppendEntriesResponse {
                term,
                success: false,
                match_index: 0,
                conflict_index: Some(last_index + 1),
                conflict_term: None,
            });
        }

        if !self
            .state
            .log
            .matches(request.prev_log_index, request.prev_log_term)
        {
            let conflict_term = self.state.log.term_at(request.prev_log_index);
            let conflict_index = self
                .state
                .log
                .first_index_of_term_run(request.prev_log_index);
            debug!(
                "Node {} term mismatch at index {}: have {:?}, leader has {}",
                self.id, request.prev_log_index, conflict_term, request.prev_log_term
            );
            return Ok(AppendEntriesResponse {
                term,
                success: false,
                match_index: 0,
                conflict_index: Some(conflict_index),
                conflict_term,
            });
        }

        if self.merge_entries(request.prev_log_index, &request.entries)? {
            self.persist()?;
        }

        let last_new_index = request.last_index();
        if request.leader_commit > self.state.commit_index {
            let commit_index = request.leader_commit.min(last_new_index);
            if commit_index > self.state.commit_index {
                debug!(
                    "Node {} advancing commit index {} -> {}",
                    self.id, self.state.commit_index, commit_index
                );
                self.state.commit_index = commit_index;
            }
        }

        Ok(AppendEntriesResponse {
            term,
            success: true,
            match_index: last_new_index,
            conflict_index: None,
            conflict_term: None,
        })
    }

    /// Merges leader entries that follow `prev_log_index` into the log.
    /// Returns whether the log changed.
    fn merge_entries(
        &mut self,
        prev_log_index: u64,
        entries: &[LogEntry],
    ) -> Result<bool, RaftError> {
        for (offset, entry) in entries.iter().enumerate() {
            if entry.index != prev_log_index + 1 + offset as u64 {
                return Err(RaftError::InvalidLogIndex(entry.index));
            }
        }

        let mut changed = false;
        for entry in entries {
            match self.state.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(existing) => {
                    if entry.index <= self.state.commit_index {
                        return Err(RaftError::SafetyViolation(format!(
                            "leader entry at index {} (term {}) conflicts with committed entry of term {}",
                            entry.index, entry.term, existing
                        )));
                    }
                    warn!(
                        "Node {} truncating log from index {} (term {} replaced by term {})",
                        self.id, entry.index, existing, entry.term
                    );
                    self.state.log.truncate_from(entry.index)?;
                    self.state.log.append_entry(entry.clone())?;
                    changed = true;
                }
                None => {
                    self.state.log.append_entry(entry.clone())?;
                    changed = true;
                }
            }
        }

        Ok(changed)
    }

    pub fn handle_append_response(
        &mut self,
        peer: &str,
        request: &AppendEntriesRequest,
        response: &AppendEntriesResponse,
    ) -> Result<ReplicationOutcome, RaftError> {
        let mut outcome = ReplicationOutcome::default();

        if response.term > self.state.current_term() {
            info!(
                "Node {} saw term {} from {}, stepping down",
                self.id, response.term, peer
            );
            self.step_down(response.term)?;
            return Ok(outcome);
        }

        // The leadership this request was sent under may be gone.
        if !self.is_leader() || self.state.current_term() != request.term {
            debug!(
                "Node {} discarding AppendEntries reply from {} for term {}",
                self.id, peer, request.term
            );
            return Ok(outcome);
        }

        let Some(next_index) = self.state.next_index(peer) else {
            warn!("Node {} got AppendEntries reply from unknown peer {}", self.id, peer);
            return Ok(outcome);
        };

        if response.success {
            let matched = request.last_index();
            let match_index = self.state.match_index(peer).unwrap_or(0).max(matched);
            self.state.match_index.insert(peer.to_string(), match_index);
            self.state
                .next_index
                .insert(peer.to_string(), match_index + 1);

            outcome.commit_advanced = self.advance_commit_index();
            if match_index < self.state.log.last_index() {
                outcome.follow_up = self.append_request_for(peer);
            }
        } else {
            if next_index != request.prev_log_index + 1 || request.prev_log_index == 0 {
                debug!(
                    "Node {} ignoring stale rejection from {} (prev {}, next {})",
                    self.id, peer, request.prev_log_index, next_index
                );
                return Ok(outcome);
            }

            let new_next = self.next_index_after_conflict(request.prev_log_index, response);
            debug!(
                "Node {} backing off next index for {}: {} -> {}",
                self.id, peer, next_index, new_next
            );
            self.state.next_index.insert(peer.to_string(), new_next);
            outcome.follow_up = self.append_request_for(peer);
        }

        Ok(outcome)
    }

    /// Where to resume a peer after it rejected `prev_log_index`. Always
    /// strictly below the rejected `next_index` and never below 1.
    fn next_index_after_conflict(&self, prev_log_index: u64, response: &AppendEntriesResponse) -> u64 {
        let hint = match (response.conflict_term, response.conflict_index) {
            (Some(term), Some(conflict_index)) => self
                .state
                .log
                .last_index_of_term(term)
                .map(|index| index + 1)
                .unwrap_or(conflict_index),
            (None, Some(conflict_index)) => conflict_index,
            _ => prev_log_index,
        };
        hint.min(prev_log_index).max(1)
    }

    /// Commits the highest current-term index held by a majority. Returns
    /// whether the commit index moved.
    pub(crate) fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }

        let current_term = self.state.current_term();
        let quorum = self.quorum();
        let mut index = self.state.log.last_index();

        while index > self.state.commit_index {
            match self.state.log.term_at(index) {
                Some(term) if term == current_term => {}
                // Older entries only commit by being carried under a current-term entry.
                _ => break,
            }

            let replicas = 1 + self
                .state
                .match_index
                .values()
                .filter(|&&matched| matched >= index)
                .count();
            if replicas >= quorum {
                debug!(
                    "Node {} committing up to index {} ({} of {} replicas)",
                    self.id,
                    index,
                    replicas,
                    self.peers.len() + 1
                );
                self.state.commit_index = index;
                return true;
            }
            index -= 1;
        }

        false
    }
}
