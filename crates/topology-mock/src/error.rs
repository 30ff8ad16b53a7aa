//! Error types for the mock topology implementation.

use cachex_topology::{NodeId, TopologyError};
use thiserror::Error;

/// Error type for the mock topology implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// Error when a node is not found in the topology.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Error when a node is added twice.
    #[error("Node already joined: {0}")]
    NodeAlreadyJoined(NodeId),

    /// Error publishing the new snapshot.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}
