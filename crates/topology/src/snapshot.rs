//! Versioned membership snapshots

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Member, NodeId};

/// Membership of the cluster at one topology version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    version: u64,
    members: Vec<Member>,
}

impl TopologySnapshot {
    /// Create a snapshot. Members are kept sorted by join order.
    pub fn new(version: u64, mut members: Vec<Member>) -> Self {
        members.sort_by_key(|m| (m.order(), *m.node_id()));
        Self { version, members }
    }

    /// Topology version of this snapshot
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Members ordered from oldest to youngest
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Ids of all members
    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.members.iter().map(|m| *m.node_id()).collect()
    }

    /// Look up a member by id
    pub fn member(&self, node_id: &NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.node_id() == node_id)
    }

    /// Whether a node is part of this topology
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.member(node_id).is_some()
    }

    /// The oldest surviving member, which coordinates exchange rounds
    pub fn coordinator(&self) -> Option<NodeId> {
        self.members.first().map(|m| *m.node_id())
    }

    /// Oldest member among `candidates` that is still present
    pub fn coordinator_among(&self, candidates: &BTreeSet<NodeId>) -> Option<NodeId> {
        self.members
            .iter()
            .map(|m| *m.node_id())
            .find(|id| candidates.contains(id))
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the topology has no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Compute the change from `previous` to this snapshot.
    ///
    /// A member present in both snapshots with a different join order has
    /// restarted and is reported as both left and joined.
    pub fn diff(&self, previous: &TopologySnapshot) -> TopologyChange {
        let before: BTreeMap<NodeId, u64> = previous
            .members
            .iter()
            .map(|m| (*m.node_id(), m.order()))
            .collect();
        let after: BTreeMap<NodeId, u64> = self
            .members
            .iter()
            .map(|m| (*m.node_id(), m.order()))
            .collect();

        let joined = after
            .iter()
            .filter(|(id, order)| before.get(id) != Some(order))
            .map(|(id, _)| *id)
            .collect();
        let left = before
            .iter()
            .filter(|(id, order)| after.get(id) != Some(order))
            .map(|(id, _)| *id)
            .collect();

        TopologyChange {
            from_version: previous.version,
            to_version: self.version,
            joined,
            left,
        }
    }
}

/// Difference between two consecutive snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyChange {
    /// Version the change starts from
    pub from_version: u64,
    /// Version the change leads to
    pub to_version: u64,
    /// Members that joined (or rejoined after a restart)
    pub joined: BTreeSet<NodeId>,
    /// Members that left (or restarted)
    pub left: BTreeSet<NodeId>,
}

impl TopologyChange {
    /// Whether membership actually changed
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(seed: u8, order: u64) -> Member {
        Member::new(NodeId::from_seed(seed), order)
    }

    #[test]
    fn test_coordinator_is_oldest_member() {
        let snapshot = TopologySnapshot::new(3, vec![member(9, 2), member(1, 5), member(4, 1)]);

        assert_eq!(snapshot.coordinator(), Some(NodeId::from_seed(4)));
        assert_eq!(snapshot.members()[2].node_id(), &NodeId::from_seed(1));
    }

    #[test]
    fn test_coordinator_among_skips_absent_candidates() {
        let snapshot = TopologySnapshot::new(3, vec![member(1, 1), member(2, 2), member(3, 3)]);
        let candidates: BTreeSet<NodeId> = [NodeId::from_seed(3), NodeId::from_seed(2)].into();

        assert_eq!(snapshot.coordinator_among(&candidates), Some(NodeId::from_seed(2)));
    }

    #[test]
    fn test_diff_reports_joins_leaves_and_restarts() {
        let before = TopologySnapshot::new(1, vec![member(1, 1), member(2, 2), member(3, 3)]);
        let after = TopologySnapshot::new(2, vec![member(1, 1), member(3, 7), member(4, 8)]);

        let change = after.diff(&before);

        assert_eq!(change.from_version, 1);
        assert_eq!(change.to_version, 2);
        assert_eq!(
            change.joined,
            [NodeId::from_seed(3), NodeId::from_seed(4)].into()
        );
        assert_eq!(
            change.left,
            [NodeId::from_seed(2), NodeId::from_seed(3)].into()
        );
    }

    #[test]
    fn test_identical_membership_is_empty_change() {
        let before = TopologySnapshot::new(1, vec![member(1, 1)]);
        let after = TopologySnapshot::new(2, vec![member(1, 1)]);

        assert!(after.diff(&before).is_empty());
    }
}
