use tokio::time::Instant;
// Use external log crate, not our own log module
use ::log::{debug, info};

use super::{NodeId, NodeRole, RaftError, RaftNode, RequestVoteRequest, RequestVoteResponse};

/// The RequestVote broadcast produced by starting an election.
#[derive(Debug, Clone)]
pub struct ElectionRound {
    pub term: u64,
    pub request: RequestVoteRequest,
    pub peers: Vec<NodeId>,
}

impl RaftNode {
    /// Fires the election timer if its deadline has passed. Leaders never
    /// time out; they just keep drawing new deadlines.
    pub fn tick_election(&mut self, now: Instant) -> Result<Option<ElectionRound>, RaftError> {
        if self.is_leader() {
            self.reset_election_timer();
            return Ok(None);
        }
        if now < self.election_deadline {
            return Ok(None);
        }

        info!(
            "Node {} election timeout elapsed as {} in term {}, starting election",
            self.id,
            self.state.role(),
            self.state.current_term()
        );
        self.start_election().map(Some)
    }

    pub fn start_election(&mut self) -> Result<ElectionRound, RaftError> {
        self.state.vote_for_self(&self.id);
        self.state.become_candidate();
        self.leader_id = None;
        // The vote for ourselves must be durable before anyone else sees it.
        self.persist()?;
        self.reset_election_timer();

        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());

        let (last_log_index, last_log_term) = self.state.last_log();
        let term = self.state.current_term();
        let request = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };

        // Check if we have already won the election (e.g. single node cluster)
        if self.votes_received.len() >= self.quorum() {
            info!("Election won (single node) for term {term}");
            self.become_leader();
        }

        Ok(ElectionRound {
            term,
            request,
            peers: self.peers.clone(),
        })
    }

    pub fn handle_request_vote(
        &mut self,
        request: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        if request.term > self.state.current_term() {
            self.step_down(request.term)?;
        }

        let current_term = self.state.current_term();
        let can_vote = match self.state.voted_for() {
            None => true,
            Some(voted) => voted == &request.candidate_id,
        };
        let vote_granted = request.term == current_term
            && can_vote
            && self.log_is_up_to_date(request.last_log_term, request.last_log_index);

        if vote_granted {
            if self.state.voted_for().is_none() {
                self.state.vote_for(&request.candidate_id);
                self.persist()?;
            }
            self.reset_election_timer();
            info!(
                "Node {} granted vote to {} for term {}",
                self.id, request.candidate_id, current_term
            );
        } else {
            debug!(
                "Node {} denied vote to {} for term {} (current term {}, voted for {:?})",
                self.id,
                request.candidate_id,
                request.term,
                current_term,
                self.state.voted_for()
            );
        }

        Ok(RequestVoteResponse {
            term: current_term,
            vote_granted,
        })
    }

    /// Whether a candidate whose log ends at `(last_log_term, last_log_index)`
    /// is at least as up to date as this node.
    pub fn log_is_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let (our_index, our_term) = self.state.last_log();
        (last_log_term, last_log_index) >= (our_term, our_index)
    }

    /// Counts a vote reply for the election held in `election_term`.
    /// Returns true if this reply made the node leader.
    pub fn handle_vote_response(
        &mut self,
        peer: &str,
        election_term: u64,
        response: &RequestVoteResponse,
    ) -> Result<bool, RaftError> {
        if response.term > self.state.current_term() {
            self.step_down(response.term)?;
            return Ok(false);
        }

        // The election may have ended while the request was in flight.
        if self.state.role() != NodeRole::Candidate || self.state.current_term() != election_term
        {
            debug!(
                "Node {} discarding vote reply from {} for term {} (now {} in term {})",
                self.id,
                peer,
                election_term,
                self.state.role(),
                self.state.current_term()
            );
            return Ok(false);
        }

        if !response.vote_granted {
            return Ok(false);
        }

        self.votes_received.insert(peer.to_string());
        self.reset_election_timer();

        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
            return Ok(true);
        }

        Ok(false)
    }

    pub(crate) fn become_leader(&mut self) {
        if self.state.role() != NodeRole::Candidate {
            return;
        }

        info!(
            "Node {} becoming leader for term {} with {} votes",
            self.id,
            self.state.current_term(),
            self.votes_received.len()
        );

        self.state.become_leader(&self.peers);
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();
    }
}
