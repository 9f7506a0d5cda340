//! Role, known leader and the three protocol timers.
//!
//! Every transition arms and disarms the timers as one step so the arming
//! rules hold after each call:
//!
//! - `NoLeader`: election and vote armed, heartbeat disarmed.
//! - `Follower`: vote (leader liveness) armed, election and heartbeat
//!   disarmed.
//! - `Leader`: heartbeat armed, election and vote disarmed.

use std::fmt;

use serde::Serialize;

use crate::config::TimingConfig;
use crate::directory::NodeId;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    NoLeader,
    Follower,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::NoLeader => "no-leader",
            Role::Follower => "follower",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct ConsensusState {
    self_id: NodeId,
    leader: Option<NodeId>,
    pub(crate) election: Timer,
    pub(crate) vote: Timer,
    pub(crate) heartbeat: Timer,
}

impl ConsensusState {
    /// A node that has not started yet: no leader, nothing armed.
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            leader: None,
            election: Timer::default(),
            vote: Timer::default(),
            heartbeat: Timer::default(),
        }
    }

    /// Role is derived from the known leader.
    pub fn role(&self) -> Role {
        match self.leader {
            Some(id) if id == self.self_id => Role::Leader,
            Some(_) => Role::Follower,
            None => Role::NoLeader,
        }
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Enters `NoLeader` with a fresh election timeout.
    pub fn start(&mut self, timing: &TimingConfig) {
        self.leader = None;
        self.search(timing);
    }

    pub fn become_leader(&mut self, timing: &TimingConfig) {
        self.leader = Some(self.self_id);
        self.heartbeat.arm(timing.heartbeat_interval);
        self.election.disarm();
        self.vote.disarm();
    }

    pub fn follow(&mut self, leader: NodeId, timing: &TimingConfig) {
        self.leader = Some(leader);
        self.election.disarm();
        self.vote.arm(timing.vote_timeout);
        self.heartbeat.disarm();
    }

    /// A heartbeat from the leader arrived.
    pub fn refresh_liveness(&mut self, timing: &TimingConfig) {
        self.vote.arm(timing.vote_timeout);
    }

    /// The leader went away: forget it and start looking for a new one.
    pub fn leader_lost(&mut self, timing: &TimingConfig) {
        self.leader = None;
        self.search(timing);
    }

    /// Re-arms the `NoLeader` timers after an election attempt.
    pub fn search(&mut self, timing: &TimingConfig) {
        self.election.arm(timing.random_election_timeout());
        self.vote.arm(timing.vote_timeout);
        self.heartbeat.disarm();
    }

    pub fn stop(&mut self) {
        self.leader = None;
        self.election.disarm();
        self.vote.disarm();
        self.heartbeat.disarm();
    }
}
