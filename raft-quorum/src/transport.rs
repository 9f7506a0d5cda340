//! Peer connections over TCP.
//!
//! Every pair of nodes shares one connection, opened by the higher id. Both
//! sides introduce themselves with ADDCONNECTION before anything else. Once
//! the handshake is done the connection gets a reader task, which forwards
//! raw frames to the worker, and a writer task, which drains the outbox the
//! directory holds for that peer.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, TimingConfig};
use crate::directory::{ConnectionDirectory, NodeId};
use crate::message::{Hello, Message, read_frame, write_message};
use crate::node::Event;
use crate::topology::ClusterTopology;

/// What the connection tasks share with the worker.
#[derive(Clone)]
pub struct TransportContext {
    topology: ClusterTopology,
    timing: TimingConfig,
    peers: Arc<BTreeMap<NodeId, String>>,
    directory: ConnectionDirectory,
    events: mpsc::UnboundedSender<Event>,
    shutdown: CancellationToken,
}

impl TransportContext {
    pub fn new(
        config: &NodeConfig,
        directory: ConnectionDirectory,
        events: mpsc::UnboundedSender<Event>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            topology: config.topology.clone(),
            timing: config.timing.clone(),
            peers: Arc::new(config.peers.clone()),
            directory,
            events,
            shutdown,
        }
    }

    fn self_id(&self) -> NodeId {
        self.topology.self_id()
    }
}

/// Accepts peer connections until shutdown.
pub async fn accept_loop(listener: TcpListener, ctx: TransportContext) {
    loop {
        select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => spawn_acceptor(stream, addr, &ctx),
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            },
        }
    }
    debug!("listener stopped");
}

fn spawn_acceptor(stream: TcpStream, addr: SocketAddr, ctx: &TransportContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(err) = accept_connection(stream, &ctx).await {
            warn!(addr = %addr, error = %err, "rejected inbound connection");
        }
    });
}

async fn accept_connection(stream: TcpStream, ctx: &TransportContext) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let peer = read_hello(&mut reader, ctx).await?;
    write_hello(&mut writer, ctx).await?;

    info!(peer = %peer, "accepted connection");
    open_connection(peer, reader, writer, ctx);
    Ok(())
}

/// Dials every lower-id peer that is not connected, every
/// `reconnect_interval`, until shutdown.
pub async fn reconnect_loop(ctx: TransportContext) {
    let mut ticker = interval(ctx.timing.reconnect_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let targets: Vec<(NodeId, String)> = ctx
            .peers
            .iter()
            .filter(|(peer, _)| ctx.topology.dials(**peer) && !ctx.directory.contains(**peer))
            .map(|(peer, addr)| (*peer, addr.clone()))
            .collect();

        for (peer, addr) in targets {
            if ctx.shutdown.is_cancelled() {
                break;
            }
            if let Err(err) = dial(peer, &addr, &ctx).await {
                debug!(peer = %peer, addr = %addr, error = %err, "peer not reachable yet");
            }
        }
    }
    debug!("reconnect loop stopped");
}

async fn dial(peer: NodeId, addr: &str, ctx: &TransportContext) -> Result<()> {
    let stream = timeout(ctx.timing.handshake_timeout, TcpStream::connect(addr))
        .await
        .context("connect timed out")?
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_hello(&mut writer, ctx).await?;
    let announced = read_hello(&mut reader, ctx).await?;
    ensure!(
        announced == peer,
        "{addr} answered as node {announced}, expected node {peer}"
    );

    info!(peer = %peer, addr = %addr, "connected to peer");
    open_connection(peer, reader, writer, ctx);
    Ok(())
}

async fn write_hello<W>(writer: &mut W, ctx: &TransportContext) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let hello = Message::AddConnection(Hello {
        node_id: ctx.self_id(),
    });
    timeout(ctx.timing.handshake_timeout, write_message(writer, &hello))
        .await
        .context("handshake write timed out")??;
    Ok(())
}

async fn read_hello<R>(reader: &mut R, ctx: &TransportContext) -> Result<NodeId>
where
    R: AsyncBufRead + Unpin,
{
    let frame = match timeout(ctx.timing.handshake_timeout, read_frame(reader))
        .await
        .context("handshake timed out")??
    {
        Some(frame) => frame,
        None => bail!("connection closed before handshake"),
    };

    let peer = match Message::decode(&frame)? {
        Message::AddConnection(hello) => hello.node_id,
        other => bail!("expected ADDCONNECTION first, got {}", other.kind()),
    };
    ensure!(
        peer != ctx.self_id() && ctx.topology.contains(peer),
        "node {peer} is not a peer of this cluster"
    );
    Ok(peer)
}

/// Registers the connection and starts its reader and writer tasks.
fn open_connection(
    peer: NodeId,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    ctx: &TransportContext,
) {
    let (outbox, inbox) = mpsc::unbounded_channel();
    let conn_id = ctx.directory.register(peer, outbox);
    let _ = ctx.events.send(Event::PeerConnected(peer));

    tokio::spawn(write_loop(peer, writer, inbox, ctx.shutdown.clone()));
    tokio::spawn(read_loop(peer, conn_id, reader, ctx.clone()));
}

async fn read_loop(
    peer: NodeId,
    conn_id: u64,
    mut reader: BufReader<OwnedReadHalf>,
    ctx: TransportContext,
) {
    loop {
        let frame = select! {
            _ = ctx.shutdown.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                if ctx.events.send(Event::Frame { from: peer, frame }).is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!(peer = %peer, "connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(peer = %peer, error = ?err, "connection failed");
                break;
            }
        }
    }

    if ctx.directory.remove(peer, conn_id) {
        let _ = ctx.events.send(Event::PeerDisconnected(peer));
    }
}

/// Writes queued messages in order until the outbox closes.
async fn write_loop(
    peer: NodeId,
    mut writer: OwnedWriteHalf,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        let message = select! {
            _ = shutdown.cancelled() => break,
            message = inbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(err) = write_message(&mut writer, &message).await {
            warn!(peer = %peer, kind = message.kind(), error = ?err, "failed to send message");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
