//! Leader liveness broadcast and follower log catch-up.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::LogEntry;
use crate::directory::NodeId;
use crate::error::StorageError;
use crate::message::{AppendLog, Heartbeat, Message, MissingLog};
use crate::node::ConsensusNode;

impl ConsensusNode {
    /// Broadcasts the leader's latest log id and re-arms the heartbeat.
    pub(crate) async fn send_heartbeat(&mut self) {
        let heartbeat = self.heartbeat().await;
        self.directory.broadcast(&Message::Heartbeat(heartbeat));
        self.state.heartbeat.arm(self.timing.heartbeat_interval);
    }

    /// Sends a freshly connected peer a heartbeat right away, so it learns
    /// who leads without waiting for the next period.
    pub(crate) async fn greet_peer(&mut self, peer: NodeId) {
        if self.state.is_leader() {
            let heartbeat = self.heartbeat().await;
            self.directory.send_to(peer, Message::Heartbeat(heartbeat));
        }
    }

    async fn heartbeat(&self) -> Heartbeat {
        let log_id = match self.storage.latest_id().await {
            Ok(id) => i64::try_from(id).unwrap_or(i64::MAX),
            Err(err) => {
                warn!(error = %err, "cannot read log, sending heartbeat without log id");
                -1
            }
        };
        Heartbeat {
            server_id: self.id(),
            log_id,
        }
    }

    pub(crate) async fn handle_heartbeat(&mut self, heartbeat: Heartbeat) {
        let sender = heartbeat.server_id;
        match self.state.leader() {
            None => {
                info!(leader = %sender, "adopting leader from heartbeat");
                self.state.follow(sender, &self.timing);
            }
            Some(leader) if leader == sender => {
                self.state.refresh_liveness(&self.timing);
            }
            Some(leader) if leader == self.id() => {
                if !self.yields_to(&heartbeat).await {
                    debug!(other = %sender, other_log = heartbeat.log_id, "keeping leadership over competing leader");
                    return;
                }
                self.follow_leader(sender).await;
            }
            Some(leader) => {
                debug!(sender = %sender, leader = %leader, "ignoring heartbeat from non-leader");
                return;
            }
        }

        let Ok(leader_log_id) = u64::try_from(heartbeat.log_id) else {
            return;
        };
        let own_log_id = match self.storage.latest_id().await {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "cannot read log, skipping catch-up check");
                return;
            }
        };
        if own_log_id >= leader_log_id {
            return;
        }

        if self.catch_up_outstanding(Instant::now()) {
            debug!(own_log_id, leader_log_id, "catch-up already requested");
            return;
        }

        info!(own_log_id, leader_log_id, "behind the leader, requesting missing entries");
        let requested = self.directory.send_to(
            sender,
            Message::MissingLog(MissingLog {
                server_id: self.id(),
                log_id: own_log_id,
            }),
        );
        if requested {
            self.catch_up_since = Some(Instant::now());
        }
    }

    /// Two leaders settle on the one with the longer log, the higher id on
    /// a tie.
    async fn yields_to(&self, heartbeat: &Heartbeat) -> bool {
        let own_log_id = match self.storage.latest_id().await {
            Ok(id) => i64::try_from(id).unwrap_or(i64::MAX),
            Err(err) => {
                warn!(error = %err, "cannot read log, yielding to competing leader");
                return true;
            }
        };
        (heartbeat.log_id, heartbeat.server_id) > (own_log_id, self.id())
    }

    /// Whether a MISSINGLOG is still waiting for its APPENDLOG.
    fn catch_up_outstanding(&self, now: Instant) -> bool {
        self.catch_up_since
            .is_some_and(|since| now < since + self.timing.vote_timeout)
    }

    pub(crate) async fn handle_missing_log(&mut self, request: MissingLog) {
        if !self.state.is_leader() {
            debug!(requester = %request.server_id, "not the leader, ignoring missing-log request");
            return;
        }

        let entries = match self.storage.entries_after(request.log_id).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, requester = %request.server_id, "cannot read missing entries");
                return;
            }
        };

        debug!(requester = %request.server_id, after = request.log_id, count = entries.len(), "sending missing entries");
        self.directory.send_to(
            request.server_id,
            Message::AppendLog(AppendLog {
                server_id: self.id(),
                entries,
            }),
        );
    }

    pub(crate) async fn handle_append_log(&mut self, batch: AppendLog) {
        self.catch_up_since = None;
        match self.insert_missing_log(batch.entries).await {
            Ok(0) => debug!(leader = %batch.server_id, "nothing to catch up"),
            Ok(count) => info!(leader = %batch.server_id, count, "caught up with leader"),
            Err(err) => warn!(leader = %batch.server_id, error = %err, "catch-up stopped"),
        }
    }

    /// Appends and replays `entries` in id order, skipping ids already held.
    ///
    /// Stops at the first append failure. A replay failure is logged and the
    /// remaining entries are still applied.
    pub(crate) async fn insert_missing_log(
        &mut self,
        mut entries: Vec<LogEntry>,
    ) -> Result<usize, StorageError> {
        entries.sort_by_key(|entry| entry.id);
        let own_log_id = self.storage.latest_id().await?;

        let mut appended = 0;
        for entry in entries.iter().filter(|entry| entry.id > own_log_id) {
            self.storage.append_entry(entry).await?;
            appended += 1;

            if let Err(err) = self.storage.apply_by_id(entry.id).await {
                warn!(id = entry.id, error = %err, "failed to replay caught-up entry");
            }
        }
        Ok(appended)
    }
}
