use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use log::{debug, info, warn};

use crate::raft::{Raft, RaftError, RpcRequest, RpcResponse};

use super::codec::{read_frame, write_frame};
use super::NetworkError;

/// How long a `Submit` waits for its entry to be applied.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves node-to-node and client RPCs for one `Raft` instance.
pub struct RaftServer {
    raft: Raft,
}

impl RaftServer {
    pub fn new(raft: Raft) -> Self {
        Self { raft }
    }

    /// Accepts connections until the node shuts down.
    pub async fn serve(self, listener: TcpListener) -> Result<(), NetworkError> {
        let mut shutdown = self.raft.subscribe_shutdown();
        info!(
            "Node {} serving RPCs on {}",
            self.raft.id(),
            listener.local_addr()?
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!("Accepted connection from {addr}");
                    let raft = self.raft.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(raft, stream).await {
                            debug!("Connection from {addr} ended: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("Node {} stopped serving RPCs", self.raft.id());
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(raft: Raft, mut stream: TcpStream) -> Result<(), NetworkError> {
    stream.set_nodelay(true)?;
    while let Some(request) = read_frame::<_, RpcRequest>(&mut stream).await? {
        let response = dispatch(&raft, request).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

/// Routes one request to the node and turns the outcome into a response frame.
pub async fn dispatch(raft: &Raft, request: RpcRequest) -> RpcResponse {
    let result = match request {
        RpcRequest::RequestVote(req) => raft
            .handle_request_vote(req)
            .await
            .map(RpcResponse::RequestVote),
        RpcRequest::AppendEntries(req) => raft
            .handle_append_entries(req)
            .await
            .map(RpcResponse::AppendEntries),
        RpcRequest::Submit { command } => submit(raft, command).await,
        RpcRequest::Status => Ok(RpcResponse::Status(raft.status().await)),
    };

    match result {
        Ok(response) => response,
        Err(RaftError::NotLeader { leader }) => RpcResponse::NotLeader { leader },
        Err(e) => {
            warn!("Node {} failed to serve request: {e}", raft.id());
            RpcResponse::Error(e.to_string())
        }
    }
}

async fn submit(raft: &Raft, command: Vec<u8>) -> Result<RpcResponse, RaftError> {
    let proposal = raft.submit_command(command).await?;
    let index = proposal.index;
    let output = timeout(SUBMIT_TIMEOUT, proposal.wait())
        .await
        .map_err(|_| RaftError::Timeout)??;
    Ok(RpcResponse::Applied { index, output })
}
