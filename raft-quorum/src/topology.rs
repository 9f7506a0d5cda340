use anyhow::{Result, ensure};

use crate::directory::NodeId;

/// Fixed cluster membership: node ids `1..=size`, one of which is this node.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    self_id: NodeId,
    size: u64,
}

impl ClusterTopology {
    pub fn new(self_id: NodeId, size: u64) -> Result<Self> {
        ensure!(size > 0, "topology requires at least one node");
        ensure!(
            (1..=size).contains(&self_id.get()),
            "node id {self_id} is outside the cluster range 1..={size}"
        );
        Ok(Self { self_id, size })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Every member except this node, in ascending order.
    pub fn peer_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (1..=self.size)
            .map(NodeId::new)
            .filter(move |id| *id != self.self_id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        (1..=self.size).contains(&id.get())
    }

    /// Whether this node opens the connection to `peer`.
    ///
    /// The higher id always dials, so each pair shares exactly one socket.
    pub fn dials(&self, peer: NodeId) -> bool {
        peer != self.self_id && self.contains(peer) && self.self_id > peer
    }
}
