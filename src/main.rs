use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use tokio::net::TcpListener;

use raftcore::config::{parse_peers, NodeConfig};
use raftcore::raft::{FileStorage, LogEntry, Raft, RaftError, RpcResponse};
use raftcore::{RaftClient, RaftServer, TcpTransport};

#[derive(Parser)]
#[command(name = "raftcore")]
#[command(about = "A Raft consensus node replicating an opaque command log")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a node in a cluster
    Node {
        /// Unique ID for this node
        #[arg(short, long)]
        id: Option<String>,

        /// Directory to store data
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Address to listen on
        #[arg(short, long)]
        address: Option<String>,

        /// Comma-separated list of peer addresses (id=address)
        #[arg(short, long)]
        peers: Option<String>,

        /// JSON configuration file; flags override its values
        #[arg(short, long)]
        config: Option<String>,

        /// Clean the data directory before starting
        #[arg(long)]
        clean: bool,
    },

    /// Submit a command to a node and print the state machine output
    Submit {
        /// Address of the node, ideally the leader
        #[arg(short, long)]
        address: String,

        /// Command payload (UTF-8)
        command: String,
    },

    /// Print a node's status
    Status {
        #[arg(short, long)]
        address: String,
    },
}

/// Applies commands by echoing them back, logging each one.
fn echo_state_machine() -> impl FnMut(&LogEntry) -> Result<Vec<u8>, RaftError> + Send + 'static {
    let mut applied = 0u64;
    move |entry: &LogEntry| {
        applied += 1;
        info!(
            "Applied entry {} (term {}, #{} since start): {}",
            entry.index,
            entry.term,
            applied,
            String::from_utf8_lossy(&entry.command)
        );
        Ok(entry.command.clone())
    }
}

async fn run_node(node: NodeConfig, clean: bool) -> anyhow::Result<()> {
    let listen_addr = node.listen_addr.clone();
    let node_data_dir = node.node_data_dir();

    if clean {
        info!("--clean flag detected, removing data directory: {node_data_dir}");
        let node_data_path = Path::new(&node_data_dir);
        if node_data_path.exists() {
            std::fs::remove_dir_all(node_data_path)?;
        }
    }

    let config = node.into_raft_config()?;
    for (peer_id, peer_addr) in &config.peers {
        info!("Added peer: {peer_id} at {peer_addr}");
    }

    let storage = FileStorage::new(&config.data_dir)?;
    let transport = Arc::new(TcpTransport::new(&config.peers));
    let raft = Raft::new(config, Box::new(storage), transport)?;

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    raft.start(echo_state_machine());

    let stopper = raft.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            stopper.shutdown().await;
        }
    });

    RaftServer::new(raft).serve(listener).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let cli = Cli::parse();

    match cli.command {
        Command::Node {
            id,
            data_dir,
            address,
            peers,
            config,
            clean,
        } => {
            let mut node = match config {
                Some(path) => NodeConfig::from_file(&path)
                    .with_context(|| format!("failed to load config {path}"))?,
                None => NodeConfig::default(),
            };
            if let Some(id) = id {
                node.node_id = id;
            }
            if let Some(data_dir) = data_dir {
                node.data_dir = data_dir;
            }
            if let Some(address) = address {
                node.listen_addr = address;
            }
            if let Some(peers) = peers {
                node.peers = parse_peers(&peers)?;
            }

            info!("Starting node {} at {}", node.node_id, node.listen_addr);
            run_node(node, clean).await?;
        }
        Command::Submit { address, command } => {
            let client = RaftClient::new(&address).with_timeout(Duration::from_secs(10));
            let response = client.submit(command.into_bytes()).await?;

            match response {
                RpcResponse::Applied { index, output } => {
                    println!("applied at index {index}: {}", String::from_utf8_lossy(&output));
                }
                RpcResponse::NotLeader { leader: Some(leader) } => {
                    bail!("{address} is not the leader; current leader is {leader}")
                }
                RpcResponse::NotLeader { leader: None } => {
                    bail!("{address} is not the leader and knows no leader yet")
                }
                other => bail!("unexpected response: {other:?}"),
            }
        }
        Command::Status { address } => {
            let status = RaftClient::new(&address).status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
