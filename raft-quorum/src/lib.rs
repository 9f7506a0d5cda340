//! Quorum-replicated database nodes.
//!
//! A fixed-size cluster elects one leader with randomized timeouts, keeps it
//! alive with heartbeats, and runs every client read or write as a voting
//! round: peers execute the same operation and answer with a hash of their
//! result, and the leader only succeeds when enough of them agree with its
//! own. Writes go to an append-only command log on every node before they
//! are applied; a lagging follower pulls the entries it is missing from the
//! leader.
//!
//! # Architecture
//!
//! - **Worker task**: owns the [`node::ConsensusNode`] and processes one
//!   event at a time (frames, connection changes, client requests, timers)
//! - **Transport tasks**: a listener, a reconnect loop and one reader/writer
//!   pair per peer connection
//! - **Storage**: the [`store::CommandLog`] and [`store::QueryExecutor`]
//!   collaborators, with [`store::MemoryDatabase`] as the in-memory backend
//!
//! # Modules
//!
//! - [`runtime`]: worker loop, node spawning, [`runtime::NodeHandle`]
//! - [`node`]: the consensus coordinator and its events
//! - [`state`]: role, leader and timers
//! - [`election`], [`heartbeat`], [`voting`]: protocol handlers
//! - [`router`]: decodes inbound frames and dispatches them
//! - [`transport`]: TCP connections and the reconnect loop
//! - [`directory`]: node ids and live connections
//! - [`message`]: peer wire format
//! - [`store`], [`statement`], [`command`]: storage, SQL subset, log entries
//! - [`config`], [`topology`]: node configuration
//! - [`protocol`]: console command parsing

pub mod command;
pub mod config;
pub mod directory;
pub mod election;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod node;
pub mod protocol;
pub mod router;
pub mod runtime;
pub mod state;
pub mod statement;
pub mod store;
pub mod timer;
pub mod topology;
pub mod transport;
pub mod voting;
