pub mod client;
pub mod codec;
pub mod error;
pub mod local;
pub mod server;

pub use client::{RaftClient, TcpTransport};
pub use error::NetworkError;
pub use local::{LocalNetwork, LocalTransport};
pub use server::RaftServer;

use async_trait::async_trait;

use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};

/// Delivers node-to-node RPCs. Implementations only move messages; all
/// protocol decisions stay with the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, NetworkError>;

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NetworkError>;
}
