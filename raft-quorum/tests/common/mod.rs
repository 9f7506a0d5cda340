//! Test harness for a cluster of real nodes talking over localhost TCP.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use futures::future::join_all;
use raft_quorum::config::{NodeConfig, PeerAddressing, TimingConfig};
use raft_quorum::directory::NodeId;
use raft_quorum::node::NodeStatus;
use raft_quorum::runtime::{NodeHandle, spawn_node};
use raft_quorum::state::Role;
use raft_quorum::store::{MemoryDatabase, Storage};
use raft_quorum::topology::ClusterTopology;
use tokio::time::{Instant, sleep};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Elections only happen when a test asks for one; heartbeats stay fast so
/// followers learn about the leader and catch up quickly.
pub fn quiet_timing() -> TimingConfig {
    TimingConfig {
        election_timeout_min: Duration::from_secs(30),
        election_timeout_max: Duration::from_secs(60),
        heartbeat_interval: Duration::from_millis(100),
        vote_timeout: Duration::from_secs(60),
        voting_timeout: Duration::from_secs(5),
        reconnect_interval: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(2),
    }
}

/// Short timers so nodes elect and re-elect on their own. The election
/// range stays below the vote timeout so the random draw decides who
/// campaigns first.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(450),
        heartbeat_interval: Duration::from_millis(100),
        vote_timeout: Duration::from_millis(500),
        voting_timeout: Duration::from_secs(5),
        reconnect_interval: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(2),
    }
}

pub struct TestCluster {
    size: u64,
    base_port: u16,
    timing: TimingConfig,
    handles: BTreeMap<u64, NodeHandle>,
    dbs: BTreeMap<u64, Arc<MemoryDatabase>>,
}

impl TestCluster {
    /// Spawns `size` nodes on `127.0.0.1:<base_port + id - 1>`.
    pub async fn spawn(size: u64, base_port: u16, timing: TimingConfig) -> Result<Self> {
        let mut cluster = Self {
            size,
            base_port,
            timing,
            handles: BTreeMap::new(),
            dbs: BTreeMap::new(),
        };
        for id in 1..=size {
            cluster.start_node(id).await?;
        }
        Ok(cluster)
    }

    fn addr(&self, id: u64) -> String {
        format!("127.0.0.1:{}", self.base_port + (id - 1) as u16)
    }

    /// Starts node `id` with an empty database, retrying while its port is
    /// still held by a previous incarnation.
    pub async fn start_node(&mut self, id: u64) -> Result<()> {
        let topology = ClusterTopology::new(NodeId::new(id), self.size)?;
        let overrides = (1..=self.size)
            .filter(|peer| *peer != id)
            .map(|peer| (NodeId::new(peer), self.addr(peer)))
            .collect();
        let config = NodeConfig::new(
            topology,
            self.addr(id),
            &PeerAddressing::default(),
            overrides,
            self.timing.clone(),
        )?;

        let db = Arc::new(MemoryDatabase::new());
        let mut attempts = 0;
        let handle = loop {
            match spawn_node(config.clone(), Storage::in_memory(db.clone())).await {
                Ok(handle) => break handle,
                Err(_) if attempts < 20 => {
                    attempts += 1;
                    sleep(Duration::from_millis(100)).await;
                }
                Err(err) => return Err(err),
            }
        };

        self.handles.insert(id, handle);
        self.dbs.insert(id, db);
        Ok(())
    }

    pub fn node(&self, id: u64) -> &NodeHandle {
        self.handles.get(&id).expect("node not running")
    }

    pub fn db(&self, id: u64) -> &MemoryDatabase {
        self.dbs.get(&id).expect("node not running")
    }

    pub async fn stop_node(&mut self, id: u64) -> Result<()> {
        if let Some(handle) = self.handles.remove(&id) {
            handle.shutdown().await?;
        }
        Ok(())
    }

    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::new();
        for handle in self.handles.values() {
            if let Ok(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Waits until every running node is connected to every other one.
    pub async fn wait_for_mesh(&self, timeout: Duration) -> Result<()> {
        let expected = self.handles.len() - 1;
        self.wait_until(timeout, "full mesh", |statuses| {
            statuses.iter().all(|s| s.connected_peers.len() == expected)
        })
        .await
    }

    /// Waits until every running node follows `leader`.
    pub async fn wait_for_leader_consensus(&self, leader: u64, timeout: Duration) -> Result<()> {
        let leader = NodeId::new(leader);
        self.wait_until(timeout, "leader consensus", |statuses| {
            statuses.iter().all(|s| s.leader_id == Some(leader))
        })
        .await
    }

    /// Waits for exactly one leader that every running node agrees on.
    pub async fn wait_for_single_leader(&self, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses = self.statuses().await;
            let leaders: Vec<NodeId> = statuses
                .iter()
                .filter(|s| s.role == Role::Leader)
                .map(|s| s.node_id)
                .collect();
            if let [leader] = leaders.as_slice() {
                if statuses.iter().all(|s| s.leader_id == Some(*leader)) {
                    return Ok(leader.get());
                }
            }
            if Instant::now() >= deadline {
                bail!("timeout waiting for a single leader, saw {leaders:?}");
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn wait_until<F>(&self, timeout: Duration, what: &str, mut done: F) -> Result<()>
    where
        F: FnMut(&[NodeStatus]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses = self.statuses().await;
            if done(&statuses) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("timeout waiting for {what}: {statuses:#?}");
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Brings up the mesh and makes `leader` win an election.
    pub async fn elect(&self, leader: u64) -> Result<()> {
        self.wait_for_mesh(Duration::from_secs(5)).await?;
        self.node(leader).campaign()?;
        self.wait_for_leader_consensus(leader, Duration::from_secs(5)).await
    }

    pub async fn shutdown(self) -> Result<()> {
        for result in join_all(self.handles.into_values().map(NodeHandle::shutdown)).await {
            result?;
        }
        Ok(())
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !check() {
        if Instant::now() >= deadline {
            bail!("timeout waiting for {what}");
        }
        sleep(POLL_INTERVAL).await;
    }
    Ok(())
}
