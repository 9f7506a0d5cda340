//! Per-operation quorum voting.
//!
//! The leader runs every client `get`/`post` as a round: peers execute the
//! same operation locally and answer with a hash of their result. The round
//! succeeds when every connected peer has answered, the most frequent hash
//! is the leader's own, and it was returned by at least half of the peers.
//! Rounds run one at a time; later operations wait in FIFO order.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::directory::NodeId;
use crate::error::{ConsensusError, StorageError};
use crate::message::{LogRef, Message, Method, VotingRequest, VotingResponse};
use crate::node::ConsensusNode;

/// A client operation waiting for the worker.
#[derive(Debug)]
pub struct ClientOp {
    pub method: Method,
    pub command: Command,
    pub respond_to: oneshot::Sender<Result<Value, ConsensusError>>,
}

/// What a client operation reports back, `{success, data | message}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<Result<Value, ConsensusError>> for ConsensusResponse {
    fn from(result: Result<Value, ConsensusError>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                message: None,
            },
            Err(err) => Self {
                success: false,
                data: None,
                message: Some(err.to_string()),
            },
        }
    }
}

/// Hash of an execution outcome as exchanged during voting.
pub fn result_hash(result: &Result<Value, StorageError>) -> String {
    let envelope = match result {
        Ok(data) => json!({ "success": true, "data": data }),
        Err(err) => json!({ "success": false, "data": err.to_string() }),
    };
    hex::encode(Sha256::digest(envelope.to_string().as_bytes()))
}

/// Hashes returned by peers for the round in flight.
#[derive(Debug, Default)]
pub struct HashTally {
    voters: HashSet<NodeId>,
    counts: HashMap<String, usize>,
}

impl HashTally {
    /// Records `voter`'s hash. A second answer from the same peer is ignored.
    pub fn record(&mut self, voter: NodeId, hash: String) -> bool {
        if !self.voters.insert(voter) {
            return false;
        }
        *self.counts.entry(hash).or_default() += 1;
        true
    }

    pub fn votes(&self) -> usize {
        self.voters.len()
    }

    /// `None` while votes are still missing, otherwise whether the round
    /// reached consensus on `own_hash`. A tie for the most frequent hash is
    /// not consensus.
    pub fn resolve(&self, peer_count: usize, own_hash: &str) -> Option<bool> {
        if self.votes() < peer_count {
            return None;
        }

        let top = self.counts.values().copied().max().unwrap_or(0);
        let mut leaders = self.counts.iter().filter(|(_, count)| **count == top);
        let decision = match (leaders.next(), leaders.next()) {
            (Some((hash, count)), None) => hash == own_hash && 2 * count >= peer_count,
            _ => false,
        };
        Some(decision)
    }
}

/// The round the leader is currently running.
#[derive(Debug)]
pub struct VotingRound {
    pub round: u64,
    pub method: Method,
    pub own_hash: String,
    /// Local result returned on success: rows for GET, the appended id for POST.
    pub local: Result<Value, StorageError>,
    /// Id appended to the leader's log for a POST.
    pub log_id: Option<u64>,
    pub tally: HashTally,
    pub respond_to: oneshot::Sender<Result<Value, ConsensusError>>,
    pub deadline: Instant,
}

impl ConsensusNode {
    pub(crate) async fn submit(&mut self, op: ClientOp) {
        if !self.state.is_leader() {
            let _ = op.respond_to.send(Err(ConsensusError::NotLeader {
                leader: self.state.leader(),
            }));
            return;
        }
        self.queue.push_back(op);
        self.run_next().await;
    }

    /// Starts queued operations until one of them is left waiting for votes.
    pub(crate) async fn run_next(&mut self) {
        while self.voting.is_none() && self.state.is_leader() {
            let Some(op) = self.queue.pop_front() else {
                return;
            };
            self.begin_round(op).await;
            self.check_round().await;
        }
    }

    async fn begin_round(&mut self, op: ClientOp) {
        if self.directory.count() == 0 && self.topology.size() > 1 {
            warn!("no peers connected, rejecting client operation");
            let _ = op.respond_to.send(Err(ConsensusError::NoQuorum));
            return;
        }

        self.next_voting_round += 1;
        let round = self.next_voting_round;
        let request = Message::RequestConsensusVoting(VotingRequest {
            method: op.method,
            query: op.command.query.clone(),
            values: op.command.values.clone(),
            round: Some(round),
        });

        let (local, own_hash, log_id) = match op.method {
            Method::Get => {
                self.directory.broadcast(&request);
                let local = self
                    .storage
                    .execute(&op.command.query, op.command.values.as_deref())
                    .await;
                let own_hash = result_hash(&local);
                (local, own_hash, None)
            }
            Method::Post => {
                // A failed local append must never reach the peers.
                let log_id = match self.storage.append(&op.command).await {
                    Ok(id) => id,
                    Err(err) => {
                        warn!(error = %err, "leader failed to append command");
                        let _ = op.respond_to.send(Err(err.into()));
                        return;
                    }
                };
                self.directory.broadcast(&request);
                let local = Ok(json!(log_id));
                let own_hash = result_hash(&local);
                (local, own_hash, Some(log_id))
            }
        };

        debug!(round, method = ?op.method, query = %op.command.query, "voting round started");
        self.voting = Some(VotingRound {
            round,
            method: op.method,
            own_hash,
            local,
            log_id,
            tally: HashTally::default(),
            respond_to: op.respond_to,
            deadline: Instant::now() + self.timing.voting_timeout,
        });
    }

    /// Peer side: execute the operation and answer with the result hash.
    pub(crate) async fn handle_voting_request(&mut self, from: NodeId, request: VotingRequest) {
        let result = match request.method {
            Method::Get => {
                self.storage
                    .execute(&request.query, request.values.as_deref())
                    .await
            }
            Method::Post => {
                let command = Command::new(request.query.clone(), request.values.clone());
                let appended = self.storage.append(&command).await;
                if let Ok(id) = appended {
                    self.pending_append = Some(id);
                }
                appended.map(|id| json!(id))
            }
        };

        if let Err(err) = &result {
            warn!(leader = %from, method = ?request.method, error = %err, "voting request failed locally");
        }
        self.directory.send_to(
            from,
            Message::ResponseConsensusVoting(VotingResponse {
                result: result_hash(&result),
                round: request.round,
            }),
        );
    }

    pub(crate) async fn handle_voting_response(&mut self, from: NodeId, response: VotingResponse) {
        let Some(round) = self.voting.as_mut() else {
            debug!(peer = %from, "no voting round in flight, discarding vote");
            return;
        };
        if response.round.is_some_and(|r| r != round.round) {
            debug!(peer = %from, round = ?response.round, "discarding stale voting response");
            return;
        }
        if !round.tally.record(from, response.result) {
            debug!(peer = %from, "duplicate voting response");
            return;
        }

        self.check_round().await;
        self.run_next().await;
    }

    /// Resolves the round in flight once every connected peer has answered.
    pub(crate) async fn check_round(&mut self) {
        let peer_count = self.directory.count();
        let Some(round) = self.voting.as_ref() else {
            return;
        };

        let decision = if peer_count == 0 {
            Some(self.topology.size() == 1)
        } else {
            round.tally.resolve(peer_count, &round.own_hash)
        };

        match decision {
            Some(true) => self.complete_round(Ok(())).await,
            Some(false) => self.complete_round(Err(ConsensusError::NoQuorum)).await,
            None => {}
        }
    }

    pub(crate) async fn expire_round(&mut self) {
        if let Some(round) = &self.voting {
            warn!(round = round.round, votes = round.tally.votes(), "voting round timed out");
        }
        self.complete_round(Err(ConsensusError::Timeout)).await;
        self.run_next().await;
    }

    async fn complete_round(&mut self, outcome: Result<(), ConsensusError>) {
        let Some(round) = self.voting.take() else {
            return;
        };

        let result = match (round.method, outcome) {
            (Method::Get, Ok(())) => round.local.map_err(ConsensusError::from),
            (Method::Post, Ok(())) => match round.log_id {
                Some(log_id) => self.apply_write(log_id).await,
                None => Err(ConsensusError::NoQuorum),
            },
            (_, Err(err)) => {
                if let Some(log_id) = round.log_id {
                    self.abort_write(log_id).await;
                }
                Err(err)
            }
        };

        match &result {
            Ok(_) => info!(round = round.round, method = ?round.method, "consensus reached"),
            Err(err) => info!(round = round.round, method = ?round.method, error = %err, "consensus failed"),
        }
        let _ = round.respond_to.send(result);
    }

    /// Applies an agreed write locally, then tells the peers to apply it.
    async fn apply_write(&mut self, log_id: u64) -> Result<Value, ConsensusError> {
        match self.storage.apply_by_id(log_id).await {
            Ok(result) => {
                self.directory
                    .broadcast(&Message::ApplyLog(LogRef { log_id }));
                Ok(result)
            }
            Err(err) => {
                warn!(log_id, error = %err, "leader failed to apply agreed write");
                self.abort_write(log_id).await;
                Err(err.into())
            }
        }
    }

    /// Drops the leader's unapplied entry and asks the peers to do the same.
    async fn abort_write(&mut self, log_id: u64) {
        match self.storage.truncate(log_id).await {
            Ok(true) => debug!(log_id, "truncated aborted write"),
            Ok(false) => warn!(log_id, "aborted write is no longer the latest entry"),
            Err(err) => warn!(log_id, error = %err, "failed to truncate aborted write"),
        }
        self.directory
            .broadcast(&Message::DeleteLog(LogRef { log_id }));
    }

    /// Fails the round in flight and every queued operation with `err`.
    pub(crate) async fn abandon_operations(&mut self, err: ConsensusError) {
        self.complete_round(Err(err.clone())).await;
        for op in self.queue.drain(..) {
            let _ = op.respond_to.send(Err(err.clone()));
        }
    }

    pub(crate) async fn handle_apply_log(&mut self, request: LogRef) {
        if self.pending_append == Some(request.log_id) {
            self.pending_append = None;
        }
        match self.storage.apply_by_id(request.log_id).await {
            Ok(_) => debug!(log_id = request.log_id, "applied agreed write"),
            Err(err) => warn!(log_id = request.log_id, error = %err, "failed to apply agreed write"),
        }
    }

    pub(crate) async fn handle_delete_log(&mut self, request: LogRef) {
        if self.pending_append != Some(request.log_id) {
            debug!(log_id = request.log_id, "no matching unapplied entry to delete");
            return;
        }
        self.pending_append = None;
        match self.storage.truncate(request.log_id).await {
            Ok(true) => info!(log_id = request.log_id, "deleted aborted write"),
            Ok(false) => debug!(log_id = request.log_id, "aborted write is no longer the latest entry"),
            Err(err) => warn!(log_id = request.log_id, error = %err, "failed to delete aborted write"),
        }
    }
}
