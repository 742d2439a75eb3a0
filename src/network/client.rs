use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RaftStatus, RequestVoteRequest,
    RequestVoteResponse, RpcRequest, RpcResponse,
};

use super::codec::{read_frame, write_frame};
use super::{NetworkError, Transport};

/// One-shot client for a node's RPC port.
pub struct RaftClient {
    address: String,
    timeout: Option<Duration>,
}

impl RaftClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            timeout: None,
        }
    }

    /// Bounds every call, connect included, by `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Sends one request and waits for its response on a fresh connection.
    pub async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, NetworkError> {
        match self.timeout {
            Some(limit) => timeout(limit, self.round_trip(request))
                .await
                .unwrap_or(Err(NetworkError::Timeout)),
            None => self.round_trip(request).await,
        }
    }

    async fn round_trip(&self, request: &RpcRequest) -> Result<RpcResponse, NetworkError> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, request).await?;
        match read_frame(&mut stream).await? {
            Some(response) => Ok(response),
            None => Err(NetworkError::ConnectionClosed),
        }
    }

    pub async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, NetworkError> {
        match self.call(&RpcRequest::RequestVote(request)).await? {
            RpcResponse::RequestVote(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NetworkError> {
        match self.call(&RpcRequest::AppendEntries(request)).await? {
            RpcResponse::AppendEntries(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    /// Submits a command. A `NotLeader` reply comes back as a response, not
    /// an error, so the caller can follow the leader hint.
    pub async fn submit(&self, command: Vec<u8>) -> Result<RpcResponse, NetworkError> {
        match self.call(&RpcRequest::Submit { command }).await? {
            RpcResponse::Error(message) => Err(NetworkError::Remote(message)),
            response => Ok(response),
        }
    }

    pub async fn status(&self) -> Result<RaftStatus, NetworkError> {
        match self.call(&RpcRequest::Status).await? {
            RpcResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: RpcResponse) -> NetworkError {
    match response {
        RpcResponse::Error(message) => NetworkError::Remote(message),
        other => NetworkError::UnexpectedResponse(format!("{other:?}")),
    }
}

/// Reaches peers over TCP using the addresses from the node's configuration.
pub struct TcpTransport {
    peers: HashMap<NodeId, RaftClient>,
}

impl TcpTransport {
    pub fn new(peers: &HashMap<NodeId, String>) -> Self {
        let peers = peers
            .iter()
            .map(|(id, address)| (id.clone(), RaftClient::new(address)))
            .collect();
        Self { peers }
    }

    fn client(&self, peer: &str) -> Result<&RaftClient, NetworkError> {
        self.peers
            .get(peer)
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, NetworkError> {
        self.client(peer)?.request_vote(request).await
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NetworkError> {
        self.client(peer)?.append_entries(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_peer_is_reported() {
        let transport = TcpTransport::new(&HashMap::new());
        let request = RequestVoteRequest {
            term: 1,
            candidate_id: "n1".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let err = transport.request_vote("n9", request).await.unwrap_err();
        assert!(matches!(err, NetworkError::UnknownPeer(p) if p == "n9"));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        // Accept and hold the connection without ever answering.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = RaftClient::new(&address).with_timeout(Duration::from_millis(100));
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, NetworkError::Timeout));
        server.abort();
    }

    #[test]
    fn remote_errors_are_not_unexpected() {
        assert!(matches!(
            unexpected(RpcResponse::Error("halted".to_string())),
            NetworkError::Remote(_)
        ));
        assert!(matches!(
            unexpected(RpcResponse::NotLeader { leader: None }),
            NetworkError::UnexpectedResponse(_)
        ));
    }
}
