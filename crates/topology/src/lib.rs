//! Cluster topology types for the cache exchange
//!
//! This crate provides:
//! - Member identity types (NodeId, Member)
//! - Versioned topology snapshots and the changes between them
//! - The `TopologySource` boundary consumed by the exchange coordinator

pub mod error;
pub mod node;
pub mod node_id;
pub mod snapshot;
pub mod source;

pub use error::TopologyError;
pub use node::Member;
pub use node_id::NodeId;
pub use snapshot::{TopologyChange, TopologySnapshot};
pub use source::{TopologyBroadcaster, TopologySource, TopologySubscription};
