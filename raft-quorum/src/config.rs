//! Node configuration: identity, peer addresses and protocol timing.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use rand::Rng;

use crate::directory::NodeId;
use crate::topology::ClusterTopology;

/// Timer periods driving election, liveness and client voting.
///
/// The defaults follow the protocol: an election timeout drawn from
/// 200–1000 ms, a 500 ms heartbeat and a 1500 ms vote (leader liveness)
/// timeout, which must stay longer than the heartbeat period.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub vote_timeout: Duration,
    /// Upper bound on one client voting round.
    pub voting_timeout: Duration,
    pub reconnect_interval: Duration,
    pub handshake_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(500),
            vote_timeout: Duration::from_millis(1500),
            voting_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.election_timeout_min <= self.election_timeout_max,
            "election timeout range is empty: {:?} > {:?}",
            self.election_timeout_min,
            self.election_timeout_max
        );
        ensure!(
            self.vote_timeout > self.heartbeat_interval,
            "vote timeout {:?} must be longer than the heartbeat interval {:?}",
            self.vote_timeout,
            self.heartbeat_interval
        );
        ensure!(!self.voting_timeout.is_zero(), "voting timeout must be non-zero");
        Ok(())
    }

    /// A fresh election timeout, uniform over the configured range.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

/// Predictable peer hostnames: `<host_prefix><id>:<port>`.
#[derive(Debug, Clone)]
pub struct PeerAddressing {
    pub host_prefix: String,
    pub port: u16,
}

impl Default for PeerAddressing {
    fn default() -> Self {
        Self {
            host_prefix: "raftnode_".to_string(),
            port: 3000,
        }
    }
}

impl PeerAddressing {
    pub fn address_of(&self, id: NodeId) -> String {
        format!("{}{}:{}", self.host_prefix, id, self.port)
    }
}

/// Everything a node needs to join the cluster.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub topology: ClusterTopology,
    /// Address to bind for peer connections, e.g. `0.0.0.0:3000`.
    pub listen_addr: String,
    /// Address of every other member.
    pub peers: BTreeMap<NodeId, String>,
    pub timing: TimingConfig,
}

impl NodeConfig {
    /// Resolves every peer through `addressing`, letting `overrides` replace
    /// individual addresses.
    pub fn new(
        topology: ClusterTopology,
        listen_addr: impl Into<String>,
        addressing: &PeerAddressing,
        overrides: BTreeMap<NodeId, String>,
        timing: TimingConfig,
    ) -> Result<Self> {
        timing.validate()?;
        for id in overrides.keys() {
            ensure!(
                topology.contains(*id),
                "peer override for node {id} is outside the cluster"
            );
        }

        let peers = topology
            .peer_ids()
            .map(|id| {
                let addr = overrides
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| addressing.address_of(id));
                (id, addr)
            })
            .collect();

        Ok(Self {
            topology,
            listen_addr: listen_addr.into(),
            peers,
            timing,
        })
    }

    pub fn id(&self) -> NodeId {
        self.topology.self_id()
    }
}

/// Parses `id=addr` entries into an address map.
pub fn parse_peer_overrides(entries: &[String]) -> Result<BTreeMap<NodeId, String>> {
    let mut peers = BTreeMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: u64 = id_str
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        ensure!(!addr.trim().is_empty(), "empty address in peer entry '{entry}'");
        peers.insert(NodeId::new(id), addr.trim().to_string());
    }
    Ok(peers)
}
