use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::raft::{RaftConfig, RaftError};

/// On-disk (JSON) configuration of one node process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen_addr: String,
    pub data_dir: String,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
}

/// Overrides for the protocol timings, all in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub rpc_timeout: Option<u64>,
    pub max_entries_per_append: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node1".to_string(),
            listen_addr: "127.0.0.1:8000".to_string(),
            data_dir: "data".to_string(),
            peers: vec![],
            timing: TimingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RaftError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| RaftError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Directory holding this node's state: `<data_dir>/<node_id>`.
    pub fn node_data_dir(&self) -> String {
        format!("{}/{}", self.data_dir, self.node_id)
    }

    /// Builds the protocol configuration. Peers with the node's own id are
    /// skipped so the same peer list can be shared by every node.
    pub fn into_raft_config(self) -> Result<RaftConfig, RaftError> {
        let mut config = RaftConfig::new(&self.node_id, &self.node_data_dir());
        for peer in &self.peers {
            if peer.id != self.node_id {
                config.add_peer(&peer.id, &peer.address);
            }
        }

        let timing = self.timing;
        if let Some(ms) = timing.election_timeout_min {
            config.election_timeout_min = ms;
        }
        if let Some(ms) = timing.election_timeout_max {
            config.election_timeout_max = ms;
        }
        if let Some(ms) = timing.heartbeat_interval {
            config.heartbeat_interval = ms;
        }
        if let Some(ms) = timing.rpc_timeout {
            config.rpc_timeout = ms;
        }
        if let Some(n) = timing.max_entries_per_append {
            config.max_entries_per_append = n;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parses `id=address,id=address` peer lists as given on the command line.
pub fn parse_peers(list: &str) -> Result<Vec<PeerConfig>, RaftError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|peer| match peer.split_once('=') {
            Some((id, address)) if !id.is_empty() && !address.is_empty() => Ok(PeerConfig {
                id: id.to_string(),
                address: address.to_string(),
            }),
            _ => Err(RaftError::Config(format!(
                "invalid peer '{peer}', expected id=address"
            ))),
        })
        .collect()
}
