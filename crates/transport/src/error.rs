//! Transport errors

use cachex_topology::NodeId;
use thiserror::Error;

/// Errors raised while moving envelopes between members
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No route to the recipient
    #[error("Node unreachable: {0}")]
    Unreachable(NodeId),

    /// The connection to the recipient was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Payload exceeds the configured limit
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Payload size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// The transport was shut down
    #[error("Transport shut down")]
    Shutdown,
}
