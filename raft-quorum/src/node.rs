//! The per-node consensus coordinator.
//!
//! [`ConsensusNode`] owns all consensus state: role, leader, timers, the
//! election and voting tallies, and the client queue. It is driven by a
//! single worker task (see [`crate::runtime`]) that feeds it [`Event`]s and
//! calls [`ConsensusNode::on_tick`] when the earliest deadline passes, so no
//! handler ever runs concurrently with another.
//!
//! The handlers live next to their protocol: [`crate::election`],
//! [`crate::heartbeat`] and [`crate::voting`].

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::TimingConfig;
use crate::directory::{ConnectionDirectory, NodeId};
use crate::election::VoteTally;
use crate::error::ConsensusError;
use crate::router;
use crate::state::{ConsensusState, Role};
use crate::store::Storage;
use crate::topology::ClusterTopology;
use crate::voting::{ClientOp, VotingRound};

/// Everything the worker can be asked to do.
#[derive(Debug)]
pub enum Event {
    /// A raw frame read from the connection to `from`.
    Frame { from: NodeId, frame: String },
    PeerConnected(NodeId),
    PeerDisconnected(NodeId),
    Client(ClientOp),
    Campaign,
    Status(oneshot::Sender<NodeStatus>),
}

/// Snapshot of a node for the console and the tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub connected_peers: Vec<NodeId>,
    /// `None` when the log cannot be read.
    pub latest_log_id: Option<u64>,
    pub election_armed: bool,
    pub vote_armed: bool,
    pub heartbeat_armed: bool,
    pub pending_operations: usize,
}

pub struct ConsensusNode {
    pub(crate) topology: ClusterTopology,
    pub(crate) timing: TimingConfig,
    pub(crate) directory: ConnectionDirectory,
    pub(crate) storage: Storage,
    pub(crate) state: ConsensusState,
    pub(crate) votes: VoteTally,
    pub(crate) voting: Option<VotingRound>,
    pub(crate) queue: VecDeque<ClientOp>,
    pub(crate) next_voting_round: u64,
    /// Entry appended for a POST vote that has been neither applied nor
    /// deleted yet.
    pub(crate) pending_append: Option<u64>,
    /// When the outstanding MISSINGLOG was sent.
    pub(crate) catch_up_since: Option<Instant>,
}

impl ConsensusNode {
    pub fn new(
        topology: ClusterTopology,
        timing: TimingConfig,
        directory: ConnectionDirectory,
        storage: Storage,
    ) -> Self {
        let state = ConsensusState::new(topology.self_id());
        Self {
            topology,
            timing,
            directory,
            storage,
            state,
            votes: VoteTally::default(),
            voting: None,
            queue: VecDeque::new(),
            next_voting_round: 0,
            pending_append: None,
            catch_up_since: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.topology.self_id()
    }

    pub fn state(&self) -> &ConsensusState {
        &self.state
    }

    /// Arms the initial election timers.
    pub fn start(&mut self) {
        self.state.start(&self.timing);
        info!(node = %self.id(), size = self.topology.size(), "consensus started");
    }

    pub async fn handle(&mut self, event: Event) {
        match event {
            Event::Frame { from, frame } => router::route(self, from, &frame).await,
            Event::PeerConnected(id) => {
                info!(peer = %id, peers = self.directory.count(), "peer connected");
                self.greet_peer(id).await;
            }
            Event::PeerDisconnected(id) => self.peer_disconnected(id).await,
            Event::Client(op) => self.submit(op).await,
            Event::Campaign => {
                info!("campaign requested");
                self.run_election().await;
            }
            Event::Status(reply) => {
                let status = self.status().await;
                let _ = reply.send(status);
            }
        }
    }

    async fn peer_disconnected(&mut self, id: NodeId) {
        info!(peer = %id, peers = self.directory.count(), "peer disconnected");
        if self.state.leader() == Some(id) {
            warn!(leader = %id, "lost connection to the leader");
            self.state.leader_lost(&self.timing);
            self.catch_up_since = None;
        }

        // Fewer peers may complete a round that was waiting on this one.
        self.check_election();
        self.check_round().await;
        self.run_next().await;
    }

    /// Earliest instant at which [`Self::on_tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.state.election.deadline(),
            self.state.vote.deadline(),
            self.state.heartbeat.deadline(),
            self.voting.as_ref().map(|round| round.deadline),
            self.catch_up_since.map(|since| since + self.timing.vote_timeout),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Runs every timer that is due at `now`.
    pub async fn on_tick(&mut self, now: Instant) {
        if self.state.heartbeat.is_due(now) {
            self.state.heartbeat.disarm();
            if self.state.is_leader() {
                self.send_heartbeat().await;
            }
        }

        if self.state.election.is_due(now) {
            self.state.election.disarm();
            if self.state.role() == Role::NoLeader {
                self.run_election().await;
            }
        }

        if self.state.vote.is_due(now) {
            self.state.vote.disarm();
            self.vote_timeout().await;
        }

        if self.voting.as_ref().is_some_and(|round| round.deadline <= now) {
            self.expire_round().await;
        }

        if self
            .catch_up_since
            .is_some_and(|since| since + self.timing.vote_timeout <= now)
        {
            self.catch_up_since = None;
        }
    }

    async fn vote_timeout(&mut self) {
        match self.state.role() {
            Role::Leader => {}
            // The random election timeout picks who campaigns first.
            Role::Follower => {
                warn!(leader = ?self.state.leader(), "no heartbeat from the leader, presuming it lost");
                self.state.leader_lost(&self.timing);
                self.catch_up_since = None;
            }
            Role::NoLeader => self.run_election().await,
        }
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id(),
            role: self.state.role(),
            leader_id: self.state.leader(),
            connected_peers: self.directory.ids(),
            latest_log_id: self.storage.latest_id().await.ok(),
            election_armed: self.state.election.is_armed(),
            vote_armed: self.state.vote.is_armed(),
            heartbeat_armed: self.state.heartbeat.is_armed(),
            pending_operations: self.queue.len() + usize::from(self.voting.is_some()),
        }
    }

    /// Clears timers and leader, fails outstanding operations and drops
    /// every connection.
    pub fn shutdown(&mut self) {
        self.state.stop();
        if let Some(round) = self.voting.take() {
            let _ = round.respond_to.send(Err(ConsensusError::Shutdown));
        }
        for op in self.queue.drain(..) {
            let _ = op.respond_to.send(Err(ConsensusError::Shutdown));
        }
        self.directory.clear();
        info!(node = %self.id(), "consensus stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use crate::command::Command;
    use crate::error::StorageError;
    use crate::message::{Heartbeat, Message, Method, Vote};
    use crate::store::{CommandLog, MemoryDatabase, QueryExecutor};

    type Delivery = (NodeId, NodeId, Message);

    /// Routes messages between nodes through in-memory outboxes for
    /// deterministic protocol tests.
    struct TestCluster {
        nodes: BTreeMap<u64, ConsensusNode>,
        dbs: BTreeMap<u64, Arc<MemoryDatabase>>,
        links: Vec<(NodeId, NodeId, u64, mpsc::UnboundedReceiver<Message>)>,
        directories: BTreeMap<u64, ConnectionDirectory>,
        delivered: Vec<Delivery>,
    }

    fn quiet_timing() -> TimingConfig {
        TimingConfig {
            election_timeout_min: Duration::from_secs(60),
            election_timeout_max: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            vote_timeout: Duration::from_secs(90),
            voting_timeout: Duration::from_secs(60),
            ..TimingConfig::default()
        }
    }

    impl TestCluster {
        async fn new(size: u64) -> Self {
            let mut nodes = BTreeMap::new();
            let mut dbs = BTreeMap::new();
            let mut directories = BTreeMap::new();

            for id in 1..=size {
                let db = Arc::new(MemoryDatabase::new());
                db.execute("CREATE TABLE t (v INT)", None).await.unwrap();
                let directory = ConnectionDirectory::new();
                let topology = ClusterTopology::new(NodeId::new(id), size).unwrap();
                let mut node = ConsensusNode::new(
                    topology,
                    quiet_timing(),
                    directory.clone(),
                    Storage::in_memory(db.clone()),
                );
                node.start();
                nodes.insert(id, node);
                dbs.insert(id, db);
                directories.insert(id, directory);
            }

            let mut links = Vec::new();
            for from in 1..=size {
                for to in (1..=size).filter(|to| *to != from) {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let conn_id = directories[&from].register(NodeId::new(to), tx);
                    links.push((NodeId::new(from), NodeId::new(to), conn_id, rx));
                }
            }

            Self {
                nodes,
                dbs,
                links,
                directories,
                delivered: Vec::new(),
            }
        }

        fn node(&self, id: u64) -> &ConsensusNode {
            self.nodes.get(&id).expect("node not found")
        }

        fn node_mut(&mut self, id: u64) -> &mut ConsensusNode {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn db(&self, id: u64) -> &Arc<MemoryDatabase> {
            self.dbs.get(&id).expect("db not found")
        }

        /// Delivers every message currently queued, once. Returns how many
        /// were delivered.
        async fn step(&mut self) -> usize {
            let mut batch = Vec::new();
            for (from, to, _, rx) in &mut self.links {
                while let Ok(message) = rx.try_recv() {
                    batch.push((*from, *to, message));
                }
            }

            let count = batch.len();
            for (from, to, message) in batch {
                let frame = message.encode().unwrap();
                self.delivered.push((from, to, message));
                if let Some(node) = self.nodes.get_mut(&to.get()) {
                    node.handle(Event::Frame { from, frame }).await;
                }
            }
            count
        }

        async fn stabilize(&mut self) {
            for _ in 0..100 {
                if self.step().await == 0 {
                    return;
                }
            }
            panic!("cluster did not settle");
        }

        /// Cuts the connection between `a` and `b` on both sides.
        async fn disconnect(&mut self, a: u64, b: u64) {
            let (a, b) = (NodeId::new(a), NodeId::new(b));
            let mut kept = Vec::new();
            for (from, to, conn_id, rx) in self.links.drain(..) {
                if (from, to) == (a, b) || (from, to) == (b, a) {
                    self.directories[&from.get()].remove(to, conn_id);
                } else {
                    kept.push((from, to, conn_id, rx));
                }
            }
            self.links = kept;
            self.node_mut(a.get()).handle(Event::PeerDisconnected(b)).await;
            self.node_mut(b.get()).handle(Event::PeerDisconnected(a)).await;
        }

        /// Opens a fresh connection between `a` and `b`.
        async fn connect(&mut self, a: u64, b: u64) {
            for (from, to) in [(a, b), (b, a)] {
                let (tx, rx) = mpsc::unbounded_channel();
                let conn_id = self.directories[&from].register(NodeId::new(to), tx);
                self.links.push((NodeId::new(from), NodeId::new(to), conn_id, rx));
            }
            self.node_mut(a).handle(Event::PeerConnected(NodeId::new(b))).await;
            self.node_mut(b).handle(Event::PeerConnected(NodeId::new(a))).await;
        }

        async fn elect(&mut self, id: u64) {
            self.node_mut(id).handle(Event::Campaign).await;
            self.stabilize().await;
            self.assert_leader_consensus(id);
        }

        fn assert_leader_consensus(&self, expected: u64) {
            for (id, node) in &self.nodes {
                assert_eq!(
                    node.state().leader(),
                    Some(NodeId::new(expected)),
                    "node {id} disagrees on the leader"
                );
            }
        }

        async fn submit(
            &mut self,
            id: u64,
            method: Method,
            query: &str,
            values: Option<Vec<Value>>,
        ) -> oneshot::Receiver<Result<Value, ConsensusError>> {
            let (respond_to, rx) = oneshot::channel();
            let op = ClientOp {
                method,
                command: Command::new(query, values),
                respond_to,
            };
            self.node_mut(id).handle(Event::Client(op)).await;
            rx
        }

        fn count_delivered(&self, kind: &str, from: u64) -> usize {
            self.delivered
                .iter()
                .filter(|(sender, _, message)| *sender == NodeId::new(from) && message.kind() == kind)
                .count()
        }
    }

    async fn seed_log(db: &MemoryDatabase, values: std::ops::RangeInclusive<i64>) {
        for v in values {
            let command = Command::new("INSERT INTO t (v) VALUES (?)", Some(vec![json!(v)]));
            let encoded = command.encode().unwrap();
            db.append(&encoded, chrono::Utc::now()).await.unwrap();
            db.execute(&command.query, command.values.as_deref())
                .await
                .unwrap();
        }
    }

    fn column(db: &MemoryDatabase) -> Vec<Value> {
        db.rows("t")
            .unwrap_or_default()
            .into_iter()
            .map(|row| row.get("v").cloned().unwrap_or(Value::Null))
            .collect()
    }

    #[tokio::test]
    async fn campaign_elects_exactly_one_leader() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        let leader = cluster.node(2).state();
        assert_eq!(leader.role(), Role::Leader);
        assert!(leader.heartbeat.is_armed());
        assert!(!leader.election.is_armed());
        assert!(!leader.vote.is_armed());

        for id in [1, 3] {
            let follower = cluster.node(id).state();
            assert_eq!(follower.role(), Role::Follower);
            assert!(!follower.heartbeat.is_armed());
            assert!(follower.vote.is_armed());
        }
        assert_eq!(cluster.count_delivered("ELECTIONRESULT", 2), 2);
    }

    #[tokio::test]
    async fn candidate_with_shorter_log_is_refused() {
        let mut cluster = TestCluster::new(3).await;
        seed_log(cluster.db(1), 1..=3).await;

        cluster.node_mut(2).handle(Event::Campaign).await;
        cluster.stabilize().await;

        assert_eq!(cluster.node(2).state().role(), Role::NoLeader);
        let refusals = cluster
            .delivered
            .iter()
            .filter(|(from, _, message)| {
                *from == NodeId::new(1)
                    && matches!(message, Message::VoteResponse(vote) if !vote.accept_leader)
            })
            .count();
        assert_eq!(refusals, 1);
    }

    #[tokio::test]
    async fn unreadable_log_aborts_the_election() {
        let mut cluster = TestCluster::new(3).await;
        cluster.db(2).set_available(false);

        cluster.node_mut(2).handle(Event::Campaign).await;
        cluster.stabilize().await;

        assert_eq!(cluster.count_delivered("LEADERELECTION", 2), 0);
        assert_eq!(cluster.node(2).state().role(), Role::NoLeader);
        assert!(cluster.node(2).state().election.is_armed());
    }

    #[tokio::test]
    async fn single_node_cluster_leads_itself() {
        let mut cluster = TestCluster::new(1).await;
        cluster.node_mut(1).handle(Event::Campaign).await;
        assert_eq!(cluster.node(1).state().role(), Role::Leader);

        let rx = cluster
            .submit(1, Method::Post, "INSERT INTO t (v) VALUES (?)", Some(vec![json!(1)]))
            .await;
        assert_eq!(rx.await.unwrap(), Ok(json!({ "affectedRows": 1 })));
        assert_eq!(column(cluster.db(1)), vec![json!(1)]);
    }

    #[tokio::test]
    async fn losing_the_leader_connection_clears_the_leader() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        cluster.disconnect(1, 2).await;
        let state = cluster.node(1).state();
        assert_eq!(state.leader(), None);
        assert!(state.election.is_armed());
        assert!(state.vote.is_armed());
        assert!(!state.heartbeat.is_armed());

        // Node 3 still follows node 2.
        assert_eq!(cluster.node(3).state().leader(), Some(NodeId::new(2)));
    }

    #[tokio::test]
    async fn silent_leader_is_dropped_when_the_vote_timer_fires() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        let deadline = cluster.node(1).state().vote.deadline().unwrap();
        cluster.node_mut(1).on_tick(deadline).await;
        cluster.stabilize().await;

        let state = cluster.node(1).state();
        assert_eq!(state.role(), Role::NoLeader);
        assert!(state.election.is_armed());
        assert!(state.vote.is_armed());
        assert_eq!(cluster.count_delivered("LEADERELECTION", 1), 0);
    }

    #[tokio::test]
    async fn competing_leaders_settle_when_the_link_returns() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        // Node 1 wins a second election with node 3 while cut off from node 2
        // and commits a write there.
        cluster.disconnect(1, 2).await;
        cluster.node_mut(1).handle(Event::Campaign).await;
        cluster.stabilize().await;
        assert_eq!(cluster.node(1).state().role(), Role::Leader);
        assert_eq!(cluster.node(2).state().role(), Role::Leader);
        let rx = cluster
            .submit(1, Method::Post, "INSERT INTO t (v) VALUES (?)", Some(vec![json!(5)]))
            .await;
        cluster.stabilize().await;
        assert!(rx.await.unwrap().is_ok());

        cluster.connect(1, 2).await;
        cluster.stabilize().await;

        cluster.assert_leader_consensus(1);
        assert_eq!(cluster.db(2).log_ids(), vec![1]);
        assert_eq!(column(cluster.db(2)), vec![json!(5)]);

        let rx = cluster
            .submit(2, Method::Post, "INSERT INTO t (v) VALUES (6)", None)
            .await;
        assert_eq!(
            rx.await.unwrap(),
            Err(ConsensusError::NotLeader {
                leader: Some(NodeId::new(1))
            })
        );
    }

    #[tokio::test]
    async fn leader_keeps_leadership_over_a_shorter_log() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;
        seed_log(cluster.db(2), 1..=2).await;

        let frame = Message::Heartbeat(Heartbeat {
            server_id: NodeId::new(3),
            log_id: 1,
        })
        .encode()
        .unwrap();
        cluster
            .node_mut(2)
            .handle(Event::Frame {
                from: NodeId::new(3),
                frame,
            })
            .await;

        assert_eq!(cluster.node(2).state().role(), Role::Leader);
        assert_eq!(cluster.step().await, 0);
    }

    #[tokio::test]
    async fn unreadable_leader_log_sends_no_catch_up() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;
        seed_log(cluster.db(2), 1..=3).await;
        cluster.db(2).set_available(false);

        cluster.node_mut(2).send_heartbeat().await;
        cluster.stabilize().await;

        let heartbeats: Vec<i64> = cluster
            .delivered
            .iter()
            .filter_map(|(_, _, message)| match message {
                Message::Heartbeat(heartbeat) => Some(heartbeat.log_id),
                _ => None,
            })
            .collect();
        assert_eq!(heartbeats, vec![-1, -1]);
        assert_eq!(cluster.count_delivered("MISSINGLOG", 1), 0);
        assert_eq!(cluster.count_delivered("MISSINGLOG", 3), 0);
        cluster.assert_leader_consensus(2);
    }

    #[tokio::test]
    async fn votes_from_an_earlier_round_are_discarded() {
        let mut cluster = TestCluster::new(3).await;
        cluster.node_mut(2).handle(Event::Campaign).await;
        cluster.node_mut(2).handle(Event::Campaign).await;
        assert_eq!(cluster.node(2).votes.round(), 2);

        for voter in [1, 3] {
            let frame = Message::VoteResponse(Vote {
                server_id: NodeId::new(voter),
                accept_leader: true,
                round: Some(1),
            })
            .encode()
            .unwrap();
            cluster
                .node_mut(2)
                .handle(Event::Frame {
                    from: NodeId::new(voter),
                    frame,
                })
                .await;
        }
        assert!(cluster.node(2).votes.is_empty());
        assert_eq!(cluster.node(2).state().role(), Role::NoLeader);

        // The answers to the second request still elect the node.
        cluster.stabilize().await;
        cluster.assert_leader_consensus(2);
    }

    #[tokio::test]
    async fn leader_steps_down_on_another_election_result() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        let pending = cluster
            .submit(2, Method::Get, "SELECT * FROM t", None)
            .await;
        cluster
            .node_mut(2)
            .handle(Event::Frame {
                from: NodeId::new(3),
                frame: r#"{"type":"ELECTIONRESULT","payload":{"serverId":3}}"#.to_string(),
            })
            .await;

        assert_eq!(cluster.node(2).state().role(), Role::Follower);
        assert_eq!(
            pending.await.unwrap(),
            Err(ConsensusError::NotLeader {
                leader: Some(NodeId::new(3))
            })
        );
    }

    #[tokio::test]
    async fn follower_catches_up_with_one_request() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;
        seed_log(cluster.db(2), 1..=8).await;
        seed_log(cluster.db(3), 1..=8).await;
        seed_log(cluster.db(1), 1..=4).await;

        cluster.node_mut(2).send_heartbeat().await;
        cluster.step().await;
        // A second heartbeat arrives before the batch does.
        cluster.node_mut(2).send_heartbeat().await;
        cluster.stabilize().await;

        assert_eq!(cluster.count_delivered("MISSINGLOG", 1), 1);
        assert_eq!(cluster.count_delivered("MISSINGLOG", 3), 0);
        assert_eq!(cluster.db(1).log_ids(), (1..=8).collect::<Vec<u64>>());
        assert_eq!(
            column(cluster.db(1)),
            (1..=8).map(|v| json!(v)).collect::<Vec<_>>()
        );
        assert!(cluster.node(1).catch_up_since.is_none());
    }

    #[tokio::test]
    async fn insert_missing_log_skips_entries_already_held() {
        let mut cluster = TestCluster::new(3).await;
        seed_log(cluster.db(2), 1..=6).await;
        seed_log(cluster.db(1), 1..=4).await;

        let mut batch = cluster.db(2).entries_after(2).await.unwrap();
        batch.reverse();
        let appended = cluster.node_mut(1).insert_missing_log(batch).await.unwrap();

        assert_eq!(appended, 2);
        assert_eq!(cluster.db(1).log_ids(), (1..=6).collect::<Vec<u64>>());
        assert_eq!(column(cluster.db(1)).len(), 6);
    }

    #[tokio::test]
    async fn gapped_batch_is_refused_before_anything_is_written() {
        let mut cluster = TestCluster::new(3).await;
        seed_log(cluster.db(2), 1..=7).await;
        seed_log(cluster.db(1), 1..=4).await;

        let batch = cluster.db(2).entries_after(5).await.unwrap();
        let result = cluster.node_mut(1).insert_missing_log(batch).await;

        assert_eq!(
            result,
            Err(StorageError::Diverged {
                expected: 6,
                assigned: 5
            })
        );
        assert_eq!(cluster.db(1).log_ids(), vec![1, 2, 3, 4]);
        assert_eq!(column(cluster.db(1)).len(), 4);

        // The next request asks for everything after 4 and fills the gap.
        let batch = cluster.db(2).entries_after(4).await.unwrap();
        assert_eq!(cluster.node_mut(1).insert_missing_log(batch).await, Ok(3));
        assert_eq!(cluster.db(1).log_ids(), (1..=7).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn get_succeeds_when_every_peer_agrees() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;
        for id in 1..=3 {
            seed_log(cluster.db(id), 1..=2).await;
        }

        let rx = cluster.submit(2, Method::Get, "SELECT * FROM t", None).await;
        cluster.stabilize().await;

        assert_eq!(rx.await.unwrap(), Ok(json!([{ "v": 1 }, { "v": 2 }])));
    }

    #[tokio::test]
    async fn get_fails_when_a_peer_disagrees() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;
        for id in 1..=3 {
            seed_log(cluster.db(id), 1..=2).await;
        }
        cluster
            .db(3)
            .execute("INSERT INTO t (v) VALUES (99)", None)
            .await
            .unwrap();

        let rx = cluster.submit(2, Method::Get, "SELECT * FROM t", None).await;
        cluster.stabilize().await;

        assert_eq!(rx.await.unwrap(), Err(ConsensusError::NoQuorum));
    }

    #[tokio::test]
    async fn post_replicates_to_every_node() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        let rx = cluster
            .submit(2, Method::Post, "INSERT INTO t (v) VALUES (?)", Some(vec![json!(42)]))
            .await;
        cluster.stabilize().await;

        assert_eq!(rx.await.unwrap(), Ok(json!({ "affectedRows": 1 })));
        for id in 1..=3 {
            assert_eq!(cluster.db(id).log_ids(), vec![1], "node {id} log");
            assert_eq!(column(cluster.db(id)), vec![json!(42)], "node {id} rows");
        }
        assert_eq!(cluster.count_delivered("APPLYLOG", 2), 2);
        assert!(cluster.node(1).pending_append.is_none());
    }

    #[tokio::test]
    async fn failed_post_is_deleted_everywhere() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;
        // Node 1 is one entry ahead, so its append gets a different id.
        seed_log(cluster.db(1), 1..=1).await;

        let rx = cluster
            .submit(2, Method::Post, "INSERT INTO t (v) VALUES (?)", Some(vec![json!(7)]))
            .await;
        cluster.stabilize().await;

        assert_eq!(rx.await.unwrap(), Err(ConsensusError::NoQuorum));
        assert_eq!(cluster.count_delivered("DELETELOG", 2), 2);
        assert!(cluster.db(2).log_ids().is_empty());
        assert!(cluster.db(3).log_ids().is_empty());
        // Node 1's entry got a different id and is left alone.
        assert_eq!(cluster.db(1).log_ids(), vec![1, 2]);
        assert_eq!(column(cluster.db(3)), Vec::<Value>::new());
    }

    #[tokio::test]
    async fn operations_queue_behind_the_round_in_flight() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        let first = cluster
            .submit(2, Method::Post, "INSERT INTO t (v) VALUES (?)", Some(vec![json!(1)]))
            .await;
        let second = cluster
            .submit(2, Method::Post, "INSERT INTO t (v) VALUES (?)", Some(vec![json!(2)]))
            .await;
        assert_eq!(cluster.node(2).queue.len(), 1);

        cluster.stabilize().await;
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        for id in 1..=3 {
            assert_eq!(column(cluster.db(id)), vec![json!(1), json!(2)]);
        }
    }

    #[tokio::test]
    async fn followers_reject_client_operations() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        let rx = cluster.submit(1, Method::Get, "SELECT * FROM t", None).await;
        assert_eq!(
            rx.await.unwrap(),
            Err(ConsensusError::NotLeader {
                leader: Some(NodeId::new(2))
            })
        );
    }

    #[tokio::test]
    async fn unanswered_round_times_out() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        let rx = cluster.submit(2, Method::Get, "SELECT * FROM t", None).await;
        let deadline = cluster.node(2).next_deadline().unwrap();
        cluster.node_mut(2).expire_round().await;
        assert!(deadline > Instant::now());
        assert_eq!(rx.await.unwrap(), Err(ConsensusError::Timeout));
    }

    #[tokio::test]
    async fn status_reports_timers_and_peers() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        let status = cluster.node(2).status().await;
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.connected_peers, vec![NodeId::new(1), NodeId::new(3)]);
        assert_eq!(status.latest_log_id, Some(0));
        assert!(status.heartbeat_armed);
        assert!(!status.election_armed);

        cluster.node_mut(2).shutdown();
        let status = cluster.node(2).status().await;
        assert_eq!(status.role, Role::NoLeader);
        assert!(status.connected_peers.is_empty());
        assert!(!status.heartbeat_armed);
    }

    #[tokio::test]
    async fn undecodable_frames_are_dropped() {
        let mut cluster = TestCluster::new(3).await;
        cluster.elect(2).await;

        for frame in [
            "not json",
            r#"{"payload":{"serverId":2}}"#,
            r#"{"type":"SHUTDOWN","payload":{}}"#,
            r#"{"type":"HEARBEAT","payload":{"serverId":"x"}}"#,
        ] {
            cluster
                .node_mut(1)
                .handle(Event::Frame {
                    from: NodeId::new(2),
                    frame: frame.to_string(),
                })
                .await;
        }

        assert_eq!(cluster.step().await, 0);
        assert_eq!(cluster.node(1).state().leader(), Some(NodeId::new(2)));
    }
}
