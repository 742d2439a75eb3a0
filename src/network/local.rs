//! In-process transport for running several nodes in one runtime, with
//! switchable partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, Raft, RequestVoteRequest,
    RequestVoteResponse,
};

use super::{NetworkError, Transport};

#[derive(Default)]
struct Topology {
    nodes: HashMap<NodeId, Raft>,
    isolated: HashSet<NodeId>,
}

impl Topology {
    fn route(&self, from: &str, to: &str) -> Result<Raft, NetworkError> {
        if self.isolated.contains(from) || self.isolated.contains(to) {
            return Err(NetworkError::Unreachable(to.to_string()));
        }
        self.nodes
            .get(to)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownPeer(to.to_string()))
    }
}

/// Shared switchboard; clones refer to the same network. Nodes are owned
/// by the switchboard and their transports only point back weakly, so the
/// whole cluster is freed once the last `LocalNetwork` handle goes.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    topology: Arc<RwLock<Topology>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, raft: Raft) {
        let mut topology = self.topology.write().await;
        topology.nodes.insert(raft.id().to_string(), raft);
    }

    /// Cuts `id` off from every other node in both directions.
    pub async fn isolate(&self, id: &str) {
        self.topology.write().await.isolated.insert(id.to_string());
    }

    pub async fn reconnect(&self, id: &str) {
        self.topology.write().await.isolated.remove(id);
    }

    pub async fn heal(&self) {
        self.topology.write().await.isolated.clear();
    }

    pub fn transport(&self, from: &str) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from: from.to_string(),
            topology: Arc::downgrade(&self.topology),
        })
    }
}

/// A node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    from: NodeId,
    topology: Weak<RwLock<Topology>>,
}

impl LocalTransport {
    async fn route(&self, to: &str) -> Result<Raft, NetworkError> {
        let topology = self
            .topology
            .upgrade()
            .ok_or_else(|| NetworkError::Unreachable(to.to_string()))?;
        let route = topology.read().await.route(&self.from, to);
        route
    }

    /// A reply only gets back if the link still exists once the call is done.
    async fn check_return(&self, to: &str) -> Result<(), NetworkError> {
        self.route(to).await.map(|_| ())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, NetworkError> {
        let target = self.route(peer).await?;
        let response = target
            .handle_request_vote(request)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        self.check_return(peer).await?;
        Ok(response)
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NetworkError> {
        let target = self.route(peer).await?;
        let response = target
            .handle_append_entries(request)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        self.check_return(peer).await?;
        Ok(response)
    }
}
