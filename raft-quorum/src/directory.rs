//! Node identities and the table of live peer connections.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, de};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::Message;

/// Cluster member id, `1..=N`.
///
/// Peers may send ids as numbers or numeric strings; both decode to the
/// same id, and ids are always encoded as numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(NodeId)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(id) => Ok(NodeId(id)),
            Raw::Text(text) => text
                .parse()
                .map_err(|_| de::Error::custom(format!("invalid node id '{text}'"))),
        }
    }
}

struct ConnectionRecord {
    conn_id: u64,
    outbox: mpsc::UnboundedSender<Message>,
}

struct DirectoryInner {
    records: Mutex<HashMap<NodeId, ConnectionRecord>>,
    next_conn_id: AtomicU64,
}

/// Live connections keyed by peer id.
///
/// Each record holds the sending half of the connection's outbox; the
/// transport's writer task drains it. Clones share the same table.
#[derive(Clone)]
pub struct ConnectionDirectory {
    inner: Arc<DirectoryInner>,
}

impl Default for ConnectionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                records: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<NodeId, ConnectionRecord>> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `outbox` as the connection to `id`, replacing any previous
    /// one. Returns the connection id to hand back to [`Self::remove`].
    pub fn register(&self, id: NodeId, outbox: mpsc::UnboundedSender<Message>) -> u64 {
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .records()
            .insert(id, ConnectionRecord { conn_id, outbox });
        if replaced.is_some() {
            debug!(peer = %id, conn_id, "replaced existing connection");
        }
        conn_id
    }

    /// Drops the record for `id` if it still belongs to connection
    /// `conn_id`. A newer connection to the same peer is left alone.
    pub fn remove(&self, id: NodeId, conn_id: u64) -> bool {
        let mut records = self.records();
        match records.get(&id) {
            Some(record) if record.conn_id == conn_id => {
                records.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn send_to(&self, id: NodeId, message: Message) -> bool {
        let records = self.records();
        let Some(record) = records.get(&id) else {
            warn!(peer = %id, kind = message.kind(), "no connection to peer, message dropped");
            return false;
        };
        if record.outbox.send(message).is_err() {
            warn!(peer = %id, "connection closed while sending");
            return false;
        }
        true
    }

    /// Sends `message` to every connected peer and returns how many accepted
    /// it.
    pub fn broadcast(&self, message: &Message) -> usize {
        let records = self.records();
        let mut delivered = 0;
        for (id, record) in records.iter() {
            if record.outbox.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(peer = %id, kind = message.kind(), "connection closed during broadcast");
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.records().len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.records().contains_key(&id)
    }

    /// Connected peer ids, ascending.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.records().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Drops every record, closing all outboxes.
    pub fn clear(&self) {
        self.records().clear();
    }
}
