//! Worker task, node spawning and the handle used to talk to a running node.
//!
//! A node runs as a few tokio tasks:
//!
//! - **Worker**: owns the [`ConsensusNode`], processes [`Event`]s one at a
//!   time and fires timers when their deadline passes.
//! - **Listener**: accepts peer connections.
//! - **Reconnect loop**: dials missing lower-id peers at a fixed interval.
//! - **Per-connection reader/writer**: forward frames to the worker and
//!   drain the peer's outbox.
//!
//! Everything that touches consensus state goes through the worker's event
//! queue, so the state machine itself needs no locks.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::Command;
use crate::config::NodeConfig;
use crate::directory::{ConnectionDirectory, NodeId};
use crate::error::ConsensusError;
use crate::message::Method;
use crate::node::{ConsensusNode, Event, NodeStatus};
use crate::store::Storage;
use crate::timer::wait_until;
use crate::transport::{TransportContext, accept_loop, reconnect_loop};
use crate::voting::ClientOp;

/// Handle for a running node.
///
/// Every call is a message to the worker; the worker answers on a oneshot
/// channel once the operation is resolved.
pub struct NodeHandle {
    id: NodeId,
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Address the peer listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs a read through a voting round. Only the leader accepts it.
    pub async fn get(
        &self,
        query: impl Into<String>,
        values: Option<Vec<Value>>,
    ) -> Result<Value, ConsensusError> {
        self.submit(Method::Get, Command::new(query, values)).await
    }

    /// Appends a write, votes on it and applies it on every node. Only the
    /// leader accepts it.
    pub async fn post(
        &self,
        query: impl Into<String>,
        values: Option<Vec<Value>>,
    ) -> Result<Value, ConsensusError> {
        self.submit(Method::Post, Command::new(query, values)).await
    }

    async fn submit(&self, method: Method, command: Command) -> Result<Value, ConsensusError> {
        let (respond_to, response) = oneshot::channel();
        self.events
            .send(Event::Client(ClientOp {
                method,
                command,
                respond_to,
            }))
            .map_err(|_| ConsensusError::Shutdown)?;
        response.await.map_err(|_| ConsensusError::Shutdown)?
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.events
            .send(Event::Status(respond_to))
            .context("failed to send status request")?;
        response.await.context("status response channel closed")
    }

    /// Starts an election round right away.
    pub fn campaign(&self) -> Result<()> {
        self.events
            .send(Event::Campaign)
            .context("failed to send campaign request")?;
        Ok(())
    }

    /// Stops every task of this node and waits for the worker to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.worker.await.context("worker task panicked")?;
        Ok(())
    }
}

/// Binds the peer listener and starts the node's tasks.
///
/// Failing to bind is the only fatal startup error; unreachable peers are
/// retried in the background.
pub async fn spawn_node(config: NodeConfig, storage: Storage) -> Result<NodeHandle> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let local_addr = listener.local_addr()?;

    let directory = ConnectionDirectory::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    let ctx = TransportContext::new(&config, directory.clone(), events_tx.clone(), shutdown.clone());
    let mut node = ConsensusNode::new(config.topology.clone(), config.timing.clone(), directory, storage);
    node.start();

    tokio::spawn(accept_loop(listener, ctx.clone()));
    tokio::spawn(reconnect_loop(ctx));
    let worker = tokio::spawn(run_worker(node, events_rx, shutdown.clone()));

    info!(node = %config.id(), addr = %local_addr, "node listening");
    Ok(NodeHandle {
        id: config.id(),
        local_addr,
        events: events_tx,
        shutdown,
        worker,
    })
}

async fn run_worker(
    mut node: ConsensusNode,
    mut events: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
) {
    loop {
        let deadline = node.next_deadline();
        select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => node.handle(event).await,
                None => {
                    warn!("event channel closed");
                    break;
                }
            },
            _ = wait_until(deadline) => node.on_tick(Instant::now()).await,
        }
    }
    node.shutdown();
}
