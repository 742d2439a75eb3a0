pub mod config;
pub mod network;
pub mod raft;

// Public exports
pub use config::{NodeConfig, PeerConfig};
pub use network::{LocalNetwork, RaftClient, RaftServer, TcpTransport, Transport};
pub use raft::{Raft, RaftConfig, RaftError, RaftStatus, StateMachine};
