//! Simple error types for topology operations

use thiserror::Error as ThisError;

use crate::NodeId;

/// Topology-related errors
#[derive(Clone, Debug, ThisError)]
pub enum TopologyError {
    /// A snapshot did not advance the topology version
    #[error("Topology version did not advance: current {current}, received {received}")]
    StaleVersion {
        /// Version already observed
        current: u64,
        /// Version that was delivered
        received: u64,
    },

    /// Member is not part of the topology
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Member is already part of the topology
    #[error("Node already present: {0}")]
    DuplicateNode(NodeId),

    /// The source stopped publishing snapshots
    #[error("Topology source closed")]
    Closed,
}
