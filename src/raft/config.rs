use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{NodeId, RaftError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    pub node_id: NodeId,
    pub data_dir: String,
    pub peers: HashMap<NodeId, String>, // node_id -> address
    pub election_timeout_min: u64,      // in milliseconds
    pub election_timeout_max: u64,      // in milliseconds
    pub heartbeat_interval: u64,        // in milliseconds
    pub max_entries_per_append: usize,
    pub rpc_timeout: u64, // in milliseconds
}

impl RaftConfig {
    pub fn new(node_id: &str, data_dir: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            data_dir: data_dir.to_string(),
            peers: HashMap::new(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
            rpc_timeout: 100,
        }
    }

    pub fn add_peer(&mut self, peer_id: &str, address: &str) {
        self.peers.insert(peer_id.to_string(), address.to_string());
    }

    /// Peer ids in a stable order.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of votes (or replicas) needed out of the whole cluster, self included.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.node_id.is_empty() {
            return Err(RaftError::Config("node id must not be empty".into()));
        }
        if self.election_timeout_min == 0 {
            return Err(RaftError::Config(
                "election_timeout_min must be positive".into(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout range is empty: {}..={}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be positive and below the minimum election timeout {}ms",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.peers.contains_key(&self.node_id) {
            return Err(RaftError::Config(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Config(
                "max_entries_per_append must be positive".into(),
            ));
        }
        Ok(())
    }
}
