//! Deduplication of decided change requests

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decision::Outcome;
use crate::request::DeploymentId;
use crate::round::RoundVersion;

/// A finalized decision remembered for replays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Request id
    pub deployment_id: DeploymentId,
    /// Round that decided it
    pub round: RoundVersion,
    /// Decided outcome
    pub outcome: Outcome,
}

/// Tracks deployment ids that already have a decision.
///
/// History is bounded twice: records fall out once the topology version is
/// two or more past the deciding round, and the oldest records are dropped
/// when `limit` is exceeded.
#[derive(Debug)]
pub struct RequestDeduplicator {
    records: HashMap<DeploymentId, DedupRecord>,
    order: VecDeque<DeploymentId>,
    limit: usize,
}

impl RequestDeduplicator {
    /// Create an empty deduplicator keeping at most `limit` records
    pub fn new(limit: usize) -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Whether a decision exists for this id
    pub fn seen(&self, id: &DeploymentId) -> bool {
        self.records.contains_key(id)
    }

    /// Outcome decided for this id
    pub fn outcome(&self, id: &DeploymentId) -> Option<&Outcome> {
        self.records.get(id).map(|r| &r.outcome)
    }

    /// Remember a decision. Returns false if the id was already recorded.
    pub fn record(&mut self, id: DeploymentId, round: RoundVersion, outcome: Outcome) -> bool {
        if self.records.contains_key(&id) {
            return false;
        }

        self.order.push_back(id.clone());
        self.records.insert(
            id.clone(),
            DedupRecord {
                deployment_id: id,
                round,
                outcome,
            },
        );

        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }

        true
    }

    /// Drop records decided two or more topology versions ago
    pub fn evict_stale(&mut self, topology_version: u64) -> usize {
        let records = &mut self.records;
        let before = self.order.len();

        self.order.retain(|id| {
            let keep = records
                .get(id)
                .is_some_and(|r| r.round.topology.saturating_add(2) > topology_version);
            if !keep {
                records.remove(id);
            }
            keep
        });

        let evicted = before - self.order.len();
        if evicted > 0 {
            debug!(
                "Evicted {} dedup records at topology version {}",
                evicted, topology_version
            );
        }
        evicted
    }

    /// Records in insertion order, for state transfer
    pub fn export(&self) -> Vec<DedupRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .cloned()
            .collect()
    }

    /// Merge records received from another member
    pub fn import(&mut self, records: Vec<DedupRecord>) -> usize {
        let mut imported = 0;
        for r in records {
            if self.record(r.deployment_id, r.round, r.outcome) {
                imported += 1;
            }
        }
        imported
    }

    /// Number of remembered decisions
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::RejectReason;

    fn id(s: &str) -> DeploymentId {
        DeploymentId::from(s)
    }

    #[test]
    fn test_replay_is_seen_with_same_outcome() {
        let mut dedup = RequestDeduplicator::new(16);
        let outcome = Outcome::Rejected(RejectReason::NotFound);

        assert!(dedup.record(id("d1"), RoundVersion::new(1, 1), outcome.clone()));
        assert!(!dedup.record(id("d1"), RoundVersion::new(1, 2), Outcome::Accepted));

        assert!(dedup.seen(&id("d1")));
        assert_eq!(dedup.outcome(&id("d1")), Some(&outcome));
        assert!(!dedup.seen(&id("d2")));
    }

    #[test]
    fn test_records_expire_two_topology_versions_later() {
        let mut dedup = RequestDeduplicator::new(16);
        dedup.record(id("old"), RoundVersion::new(3, 1), Outcome::Accepted);
        dedup.record(id("new"), RoundVersion::new(4, 0), Outcome::Accepted);

        assert_eq!(dedup.evict_stale(4), 0);
        assert_eq!(dedup.evict_stale(5), 1);

        assert!(!dedup.seen(&id("old")));
        assert!(dedup.seen(&id("new")));
    }

    #[test]
    fn test_history_limit_drops_oldest_first() {
        let mut dedup = RequestDeduplicator::new(2);
        for name in ["a", "b", "c"] {
            dedup.record(id(name), RoundVersion::new(1, 1), Outcome::Accepted);
        }

        assert_eq!(dedup.len(), 2);
        assert!(!dedup.seen(&id("a")));
        assert!(dedup.seen(&id("c")));
    }

    #[test]
    fn test_import_keeps_existing_records() {
        let mut dedup = RequestDeduplicator::new(16);
        dedup.record(id("a"), RoundVersion::new(1, 1), Outcome::Accepted);

        let imported = dedup.import(vec![
            DedupRecord {
                deployment_id: id("a"),
                round: RoundVersion::new(2, 1),
                outcome: Outcome::Rejected(RejectReason::NameConflict),
            },
            DedupRecord {
                deployment_id: id("b"),
                round: RoundVersion::new(2, 1),
                outcome: Outcome::Accepted,
            },
        ]);

        assert_eq!(imported, 1);
        assert_eq!(dedup.outcome(&id("a")), Some(&Outcome::Accepted));
        assert_eq!(dedup.export().len(), 2);
    }
}
