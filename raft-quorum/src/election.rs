//! Leader election: request, vote and announce.
//!
//! A candidate broadcasts its latest log id. Each peer grants its vote iff
//! the candidate's log is at least as long as its own. Once every connected
//! peer has answered, the candidate promotes itself if strictly more than
//! half of them accepted and no leader is known in the meantime.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::directory::NodeId;
use crate::error::ConsensusError;
use crate::message::{ElectionRequest, ElectionResult, Message, Vote};
use crate::node::ConsensusNode;
use crate::state::Role;

/// Votes collected for the current election round.
#[derive(Debug, Default)]
pub struct VoteTally {
    round: u64,
    votes: HashMap<NodeId, bool>,
    resolved: bool,
}

impl VoteTally {
    /// Opens a new round, discarding every vote of the previous one.
    pub fn begin(&mut self) -> u64 {
        self.round += 1;
        self.votes.clear();
        self.resolved = false;
        self.round
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Votes tagged with another round are stale. Untagged votes count
    /// toward the current round.
    pub fn is_current(&self, round: Option<u64>) -> bool {
        round.map_or(true, |round| round == self.round)
    }

    pub fn record(&mut self, voter: NodeId, accept: bool) {
        self.votes.insert(voter, accept);
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn accepted(&self) -> usize {
        self.votes.values().filter(|accept| **accept).count()
    }
}

/// A peer votes for a candidate whose log is at least as long as its own.
pub fn grant_vote(own_log_id: u64, candidate_log_id: u64) -> bool {
    candidate_log_id >= own_log_id
}

/// Strict majority of the connected peers.
pub fn has_quorum(accepted: usize, peer_count: usize) -> bool {
    accepted > peer_count / 2
}

impl ConsensusNode {
    /// Starts an election round, then re-arms the search timers if the
    /// round did not settle the election on the spot.
    pub(crate) async fn run_election(&mut self) {
        self.start_election().await;
        if self.state.role() == Role::NoLeader {
            self.state.search(&self.timing);
        }
    }

    pub(crate) async fn start_election(&mut self) {
        if self.directory.count() == 0 {
            if self.topology.size() == 1 {
                info!("single-node cluster, taking leadership");
                self.promote();
            } else {
                debug!("no peers connected, skipping election");
            }
            return;
        }

        let log_id = match self.storage.latest_id().await {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "cannot read log, skipping election");
                return;
            }
        };

        let round = self.votes.begin();
        let delivered = self.directory.broadcast(&Message::LeaderElection(ElectionRequest {
            server_id: self.id(),
            log_id,
            round: Some(round),
        }));
        info!(round, log_id, peers = delivered, "starting election");
    }

    pub(crate) async fn handle_vote_request(&mut self, request: ElectionRequest) {
        let own_log_id = match self.storage.latest_id().await {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, candidate = %request.server_id, "cannot read log, not voting");
                return;
            }
        };

        let accept = grant_vote(own_log_id, request.log_id);
        debug!(
            candidate = %request.server_id,
            candidate_log = request.log_id,
            own_log = own_log_id,
            accept,
            "answering vote request"
        );
        self.directory.send_to(
            request.server_id,
            Message::VoteResponse(Vote {
                server_id: self.id(),
                accept_leader: accept,
                round: request.round,
            }),
        );
    }

    pub(crate) fn handle_vote_response(&mut self, vote: Vote) {
        if !self.votes.is_current(vote.round) {
            debug!(voter = %vote.server_id, round = ?vote.round, "discarding stale vote");
            return;
        }
        self.votes.record(vote.server_id, vote.accept_leader);
        self.check_election();
    }

    /// Resolves the current round once every connected peer has voted.
    pub(crate) fn check_election(&mut self) {
        let peer_count = self.directory.count();
        if self.votes.resolved || self.votes.is_empty() || self.votes.len() < peer_count {
            return;
        }
        self.votes.resolved = true;

        let accepted = self.votes.accepted();
        if has_quorum(accepted, peer_count) && self.state.leader().is_none() {
            info!(round = self.votes.round(), accepted, peers = peer_count, "won election");
            self.promote();
        } else {
            info!(
                round = self.votes.round(),
                accepted,
                peers = peer_count,
                leader = ?self.state.leader(),
                "election round failed"
            );
        }
    }

    fn promote(&mut self) {
        self.state.become_leader(&self.timing);
        self.catch_up_since = None;
        self.pending_append = None;
        self.directory.broadcast(&Message::ElectionResult(ElectionResult {
            server_id: self.id(),
        }));
    }

    /// Announcements are always accepted. A leader hearing of another
    /// leader steps down.
    pub(crate) async fn handle_election_result(&mut self, result: ElectionResult) {
        if result.server_id == self.id() {
            return;
        }
        self.follow_leader(result.server_id).await;
    }

    /// Follows `leader`, giving up leadership first if this node holds it.
    pub(crate) async fn follow_leader(&mut self, leader: NodeId) {
        if self.state.is_leader() {
            warn!(new_leader = %leader, "another node claims leadership, stepping down");
            self.abandon_operations(ConsensusError::NotLeader {
                leader: Some(leader),
            })
            .await;
        }

        info!(leader = %leader, "following new leader");
        self.state.follow(leader, &self.timing);
        self.catch_up_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn votes_only_for_logs_at_least_as_long() {
        assert!(grant_vote(4, 4));
        assert!(grant_vote(4, 9));
        assert!(!grant_vote(4, 3));
        assert!(grant_vote(0, 0));
    }

    #[test]
    fn quorum_is_a_strict_majority_of_peers() {
        assert!(!has_quorum(1, 2));
        assert!(has_quorum(2, 2));
        assert!(!has_quorum(1, 3));
        assert!(has_quorum(2, 3));
        assert!(has_quorum(3, 4));
        assert!(!has_quorum(2, 4));
    }

    #[test]
    fn new_round_discards_old_votes() {
        let mut tally = VoteTally::default();
        let first = tally.begin();
        tally.record(NodeId::new(1), true);
        assert_eq!(tally.accepted(), 1);

        let second = tally.begin();
        assert!(second > first);
        assert!(tally.is_empty());
        assert!(!tally.is_current(Some(first)));
        assert!(tally.is_current(Some(second)));
        assert!(tally.is_current(None));
    }
}
