//! Scriptable in-process topology source for tests and local clusters.
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;

pub use error::Error;

use std::fmt;

use cachex_topology::{
    Member, NodeId, TopologyBroadcaster, TopologySnapshot, TopologySource, TopologySubscription,
};
use parking_lot::Mutex;
use tracing::info;

struct MockState {
    version: u64,
    next_order: u64,
    members: Vec<Member>,
}

/// Mock topology source.
///
/// Every membership operation publishes exactly one new topology version.
pub struct MockTopology {
    state: Mutex<MockState>,
    broadcaster: TopologyBroadcaster,
}

impl MockTopology {
    /// Creates an empty topology at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                version: 0,
                next_order: 1,
                members: Vec::new(),
            }),
            broadcaster: TopologyBroadcaster::new(TopologySnapshot::default()),
        }
    }

    /// Creates a topology where `nodes` joined together in one version.
    #[must_use]
    pub fn with_nodes(nodes: &[NodeId]) -> Self {
        let topology = Self::new();
        if !nodes.is_empty() {
            // Fresh ids only, so publishing cannot fail.
            let _ = topology.apply(nodes, &[]);
        }
        topology
    }

    /// Adds a node; it becomes the youngest member.
    pub fn add_node(&self, node_id: NodeId) -> Result<Member, Error> {
        self.apply(&[node_id], &[])?;
        self.member(&node_id).ok_or(Error::NodeNotFound(node_id))
    }

    /// Removes a node, as failure detection would after a crash.
    pub fn remove_node(&self, node_id: NodeId) -> Result<(), Error> {
        self.apply(&[], &[node_id])
    }

    /// Restarts a node: it leaves and rejoins with a new join order in a
    /// single topology version.
    pub fn restart_node(&self, node_id: NodeId) -> Result<Member, Error> {
        self.apply(&[node_id], &[node_id])?;
        self.member(&node_id).ok_or(Error::NodeNotFound(node_id))
    }

    /// Applies joins and leaves as one topology version.
    pub fn apply(&self, joined: &[NodeId], left: &[NodeId]) -> Result<(), Error> {
        let mut state = self.state.lock();

        let mut members = state.members.clone();
        for node_id in left {
            let before = members.len();
            members.retain(|m| m.node_id() != node_id);
            if members.len() == before {
                return Err(Error::NodeNotFound(*node_id));
            }
        }

        let mut next_order = state.next_order;
        for node_id in joined {
            if members.iter().any(|m| m.node_id() == node_id) {
                return Err(Error::NodeAlreadyJoined(*node_id));
            }
            members.push(Member::new(*node_id, next_order));
            next_order += 1;
        }

        let version = state.version + 1;
        self.broadcaster
            .publish(TopologySnapshot::new(version, members.clone()))?;

        info!(
            "Mock topology advanced to version {} ({} joined, {} left)",
            version,
            joined.len(),
            left.len()
        );

        state.version = version;
        state.next_order = next_order;
        state.members = members;
        Ok(())
    }

    /// Current member entry for a node.
    pub fn member(&self, node_id: &NodeId) -> Option<Member> {
        self.state
            .lock()
            .members
            .iter()
            .find(|m| m.node_id() == node_id)
            .copied()
    }
}

impl Default for MockTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTopology")
            .field("version", &state.version)
            .field("members", &state.members.len())
            .finish()
    }
}

impl TopologySource for MockTopology {
    fn snapshot(&self) -> TopologySnapshot {
        self.broadcaster.current()
    }

    fn subscribe(&self) -> TopologySubscription {
        self.broadcaster.subscribe()
    }
}
