//! Cluster member as seen by the topology source

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// A live cluster member
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Member {
    node_id: NodeId,
    order: u64,
}

impl Member {
    /// Create a new member
    pub fn new(node_id: NodeId, order: u64) -> Self {
        Member { node_id, order }
    }

    /// Get the node ID of this member
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Join order assigned by the topology source.
    ///
    /// Lower orders joined earlier. A member that restarts rejoins with a
    /// higher order.
    pub fn order(&self) -> u64 {
        self.order
    }
}
