//! CLI entry point for running one cluster node with a line console.
//!
//! Every option can also come from the environment, so a container only
//! needs `SERVER_ID` and `TOTAL_SERVERS`; peers are then found at
//! `raftnode_<id>:3000`.
//!
//! # Example usage
//!
//! Start a 3-node cluster on one machine:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- --id 1 --total-servers 3 --listen 127.0.0.1:7101
//!
//! # Terminal 2 (node 2)
//! cargo run --bin node -- --id 2 --total-servers 3 --listen 127.0.0.1:7102 \
//!   --peer 1=127.0.0.1:7101
//!
//! # Terminal 3 (node 3)
//! cargo run --bin node -- --id 3 --total-servers 3 --listen 127.0.0.1:7103 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102
//! ```
//!
//! Only the higher id dials, so each node lists the peers below it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{info, warn};

use raft_quorum::config::{NodeConfig, PeerAddressing, TimingConfig, parse_peer_overrides};
use raft_quorum::directory::NodeId;
use raft_quorum::protocol::{ConsoleCommand, HELP};
use raft_quorum::runtime::{NodeHandle, spawn_node};
use raft_quorum::store::{MemoryDatabase, Storage};
use raft_quorum::topology::ClusterTopology;
use raft_quorum::voting::ConsensusResponse;

/// Command-line arguments for a cluster node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a quorum-replicated database node")]
struct Args {
    /// This node's id, 1..=total-servers
    #[arg(long, env = "SERVER_ID")]
    id: u64,

    /// Number of nodes in the cluster
    #[arg(long, env = "TOTAL_SERVERS", default_value_t = 3)]
    total_servers: u64,

    /// Address to accept peer connections on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:3000", value_hint = ValueHint::Hostname)]
    listen: String,

    /// Hostname prefix of peers; node N is reached at <prefix>N:<peer-port>
    #[arg(long, env = "PEER_HOST_PREFIX", default_value = "raftnode_")]
    host_prefix: String,

    /// Port peers listen on
    #[arg(long, env = "PEER_PORT", default_value_t = 3000)]
    peer_port: u16,

    /// Comma-separated address overrides: id=addr,id=addr,...
    #[arg(long, env = "PEERS", value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Lower bound of the random election timeout, in milliseconds
    #[arg(long, env = "ELECTION_TIMEOUT_MIN_MS", default_value_t = 200)]
    election_min_ms: u64,

    /// Upper bound of the random election timeout, in milliseconds
    #[arg(long, env = "ELECTION_TIMEOUT_MAX_MS", default_value_t = 1000)]
    election_max_ms: u64,

    /// Heartbeat period, in milliseconds
    #[arg(long, env = "HEARTBEAT_MS", default_value_t = 500)]
    heartbeat_ms: u64,

    /// Time without a heartbeat before the leader is presumed lost, in milliseconds
    #[arg(long, env = "VOTE_TIMEOUT_MS", default_value_t = 1500)]
    vote_timeout_ms: u64,

    /// Upper bound on one client voting round, in milliseconds
    #[arg(long, env = "VOTING_TIMEOUT_MS", default_value_t = 5000)]
    voting_timeout_ms: u64,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let topology = ClusterTopology::new(NodeId::new(self.id), self.total_servers)?;
        let addressing = PeerAddressing {
            host_prefix: self.host_prefix,
            port: self.peer_port,
        };
        let overrides = parse_peer_overrides(&self.peer)?;
        let timing = TimingConfig {
            election_timeout_min: Duration::from_millis(self.election_min_ms),
            election_timeout_max: Duration::from_millis(self.election_max_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            vote_timeout: Duration::from_millis(self.vote_timeout_ms),
            voting_timeout: Duration::from_millis(self.voting_timeout_ms),
            ..TimingConfig::default()
        };
        NodeConfig::new(topology, self.listen, &addressing, overrides, timing)
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Args::parse().into_config().context("invalid configuration")?;
    let storage = Storage::in_memory(Arc::new(MemoryDatabase::new()));
    let handle = spawn_node(config, storage).await?;

    println!("Node {} ready. Type HELP (or h) for commands.", handle.id());
    run_console(&handle).await?;

    handle.shutdown().await?;
    info!("node stopped");
    Ok(())
}

async fn run_console(handle: &NodeHandle) -> Result<()> {
    let mut stdin = BufReader::new(io::stdin()).lines();

    loop {
        let line = select! {
            line = stdin.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("error: {err}");
                continue;
            }
        };

        if !execute(handle, command).await {
            return Ok(());
        }
    }
}

/// Runs one console command. Returns `false` when the console should exit.
async fn execute(handle: &NodeHandle, command: ConsoleCommand) -> bool {
    match command {
        ConsoleCommand::Get { query, values } => {
            print_response(handle.get(query, values).await.into());
        }
        ConsoleCommand::Post { query, values } => {
            print_response(handle.post(query, values).await.into());
        }
        ConsoleCommand::Status => match handle.status().await {
            Ok(status) => print_json(&status),
            Err(err) => println!("error: {err:#}"),
        },
        ConsoleCommand::Campaign => match handle.campaign() {
            Ok(()) => println!("election round started"),
            Err(err) => println!("error: {err:#}"),
        },
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Exit => return false,
    }
    true
}

fn print_response(response: ConsensusResponse) {
    print_json(&response);
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => warn!(error = %err, "failed to render output"),
    }
}
