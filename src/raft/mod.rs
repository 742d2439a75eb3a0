mod apply;
mod config;
mod election;
mod error;
mod log;
mod message;
mod node;
mod replication;
mod state;
mod storage;

pub use self::apply::{Proposal, StateMachine};
pub use self::config::RaftConfig;
pub use self::election::ElectionRound;
pub use self::error::RaftError;
pub use self::log::{Log, LogEntry};
pub use self::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    RpcRequest, RpcResponse,
};
pub use self::node::{RaftNode, RaftStatus};
pub use self::replication::ReplicationOutcome;
pub use self::state::{HardState, NodeRole, RaftState};
pub use self::storage::{FileStorage, MemStorage, PersistentState, Storage};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
// Use external log crate, not our own log module
use ::log::{debug, error, info};

use crate::network::{NetworkError, Transport};

pub type NodeId = String;

/// A running Raft node: the consensus state behind one lock, plus the timer,
/// heartbeat and apply tasks that drive it. Cheap to clone.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

struct RaftInner {
    id: NodeId,
    node: Mutex<RaftNode>,
    transport: Arc<dyn Transport>,
    heartbeat_interval: Duration,
    rpc_timeout: Duration,
    // Wakes the heartbeat task for on-demand replication.
    replicate: Notify,
    // Wakes the apply task after the commit index moves.
    apply: Notify,
    shutdown: watch::Sender<bool>,
}

impl Raft {
    pub fn new(
        config: RaftConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RaftError> {
        let heartbeat_interval = config.heartbeat();
        let rpc_timeout = config.rpc_timeout();
        let node = RaftNode::new(config, storage)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(RaftInner {
                id: node.id().to_string(),
                node: Mutex::new(node),
                transport,
                heartbeat_interval,
                rpc_timeout,
                replicate: Notify::new(),
                apply: Notify::new(),
                shutdown,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Spawns the election timer, heartbeat ticker and apply loop on the
    /// current tokio runtime.
    pub fn start<S: StateMachine>(&self, state_machine: S) {
        info!("Starting Raft node {}", self.inner.id);
        tokio::spawn(Arc::clone(&self.inner).run_election_timer());
        tokio::spawn(Arc::clone(&self.inner).run_heartbeats());
        tokio::spawn(Arc::clone(&self.inner).run_apply(state_machine));
    }

    /// Halts the node; background tasks exit and inbound RPCs are refused.
    pub async fn shutdown(&self) {
        let mut node = self.inner.node.lock().await;
        node.halt();
        drop(node);
        let _ = self.inner.shutdown.send(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub async fn status(&self) -> RaftStatus {
        self.inner.node.lock().await.status()
    }

    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        debug!("Node {} received RequestVote: {:?}", self.inner.id, request);
        let mut node = self.inner.lock_live().await?;
        let result = node.handle_request_vote(&request);
        self.inner.check(&mut node, result)
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        debug!(
            "Node {} received AppendEntries: term={}, leader={}, prev={}, entries={}",
            self.inner.id,
            request.term,
            request.leader_id,
            request.prev_log_index,
            request.entries.len()
        );
        let mut node = self.inner.lock_live().await?;
        let commit_before = node.state().commit_index();
        let result = node.handle_append_entries(&request);
        let response = self.inner.check(&mut node, result)?;
        let committed = node.state().commit_index() > commit_before;
        drop(node);

        if committed {
            self.inner.apply.notify_one();
        }
        Ok(response)
    }

    /// Appends `command` to the leader's log and starts replicating it.
    pub async fn submit_command(&self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        let mut node = self.inner.lock_live().await?;
        let commit_before = node.state().commit_index();
        let result = node.propose(command);
        let proposal = self.inner.check(&mut node, result)?;
        let committed = node.state().commit_index() > commit_before;
        drop(node);

        self.inner.replicate.notify_one();
        if committed {
            self.inner.apply.notify_one();
        }
        Ok(proposal)
    }

    /// Submits `command` and waits up to `wait` for its state machine output.
    pub async fn execute(&self, command: Vec<u8>, wait: Duration) -> Result<Vec<u8>, RaftError> {
        let proposal = self.submit_command(command).await?;
        match timeout(wait, proposal.wait()).await {
            Ok(result) => result,
            Err(_) => Err(RaftError::Timeout),
        }
    }
}

impl RaftInner {
    async fn lock_live(&self) -> Result<MutexGuard<'_, RaftNode>, RaftError> {
        let node = self.node.lock().await;
        if node.is_halted() {
            return Err(RaftError::Halted);
        }
        Ok(node)
    }

    /// Halts the node on a fatal error before handing the result back.
    fn check<T>(&self, node: &mut RaftNode, result: Result<T, RaftError>) -> Result<T, RaftError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Node {} hit a fatal error: {}", self.id, e);
                node.halt();
                let _ = self.shutdown.send(true);
            }
        }
        result
    }

    async fn run_election_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let deadline = {
                let node = self.node.lock().await;
                if node.is_halted() {
                    break;
                }
                node.election_deadline()
            };

            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = shutdown.changed() => break,
            }

            let round = {
                let mut node = self.node.lock().await;
                if node.is_halted() {
                    break;
                }
                let result = node.tick_election(Instant::now());
                let won = node.is_leader();
                match self.check(&mut node, result) {
                    Ok(round) => round.map(|round| (round, won)),
                    Err(_) => break,
                }
            };

            if let Some((round, won)) = round {
                if won {
                    self.replicate.notify_one();
                }
                for peer in round.peers.iter() {
                    tokio::spawn(Arc::clone(&self).request_vote(
                        peer.clone(),
                        round.term,
                        round.request.clone(),
                    ));
                }
            }
        }
        debug!("Election timer of node {} stopped", self.id);
    }

    async fn request_vote(self: Arc<Self>, peer: NodeId, term: u64, request: RequestVoteRequest) {
        let reply = match timeout(self.rpc_timeout, self.transport.request_vote(&peer, request))
            .await
            .unwrap_or(Err(NetworkError::Timeout))
        {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Failed to send RequestVote to {peer}: {e}");
                return;
            }
        };

        let mut node = self.node.lock().await;
        if node.is_halted() {
            return;
        }
        let result = node.handle_vote_response(&peer, term, &reply);
        if let Ok(true) = self.check(&mut node, result) {
            drop(node);
            // Announce leadership right away.
            self.replicate.notify_one();
        }
    }

    async fn run_heartbeats(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.replicate.notified() => {}
                _ = shutdown.changed() => break,
            }

            let requests = {
                let node = self.node.lock().await;
                if node.is_halted() {
                    break;
                }
                node.append_requests()
            };

            for (peer, request) in requests {
                tokio::spawn(Arc::clone(&self).replicate_to(peer, request));
            }
        }
        debug!("Heartbeat task of node {} stopped", self.id);
    }

    /// Sends `request` to `peer` and keeps following up while the peer is
    /// behind or rejects, re-validating leadership after every reply.
    async fn replicate_to(self: Arc<Self>, peer: NodeId, mut request: AppendEntriesRequest) {
        loop {
            let reply = match timeout(
                self.rpc_timeout,
                self.transport.append_entries(&peer, request.clone()),
            )
            .await
            .unwrap_or(Err(NetworkError::Timeout))
            {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("Failed to send AppendEntries to {peer}: {e}");
                    return;
                }
            };

            let follow_up = {
                let mut node = self.node.lock().await;
                if node.is_halted() {
                    return;
                }
                let result = node.handle_append_response(&peer, &request, &reply);
                match self.check(&mut node, result) {
                    Ok(outcome) => {
                        if outcome.commit_advanced {
                            self.apply.notify_one();
                        }
                        outcome.follow_up
                    }
                    Err(_) => return,
                }
            };

            match follow_up {
                Some(next) => request = next,
                None => return,
            }
        }
    }

    async fn run_apply<S: StateMachine>(self: Arc<Self>, mut state_machine: S) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = self.apply.notified() => {}
                _ = shutdown.changed() => break,
            }

            loop {
                let batch = {
                    let node = self.node.lock().await;
                    if node.is_halted() {
                        return;
                    }
                    node.entries_to_apply()
                };
                if batch.is_empty() {
                    break;
                }

                // The state machine runs outside the lock; only the
                // bookkeeping afterwards takes it again.
                for entry in batch {
                    let applied = state_machine.apply(&entry);
                    let mut node = self.node.lock().await;
                    let result = applied.and_then(|output| node.complete_apply(&entry, output));
                    if self.check(&mut node, result).is_err() {
                        return;
                    }
                }
            }
        }
        debug!("Apply task of node {} stopped", self.id);
    }
}
