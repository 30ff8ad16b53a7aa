//! Exchange rounds: versions, entries, vote collection and batch validation

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use cachex_topology::NodeId;
use serde::{Deserialize, Serialize};

use crate::decision::{Outcome, RejectReason};
use crate::error::{Error, ExchangeResult};
use crate::request::{ChangeRequest, DeploymentId};

/// Version of an exchange round.
///
/// A membership change opens `(topology, 0)`; each further batch at the same
/// topology version bumps `minor`. Ordered lexicographically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RoundVersion {
    /// Topology version the round was opened at
    pub topology: u64,
    /// Batch counter within the topology version
    pub minor: u32,
}

impl RoundVersion {
    /// Create a round version
    pub const fn new(topology: u64, minor: u32) -> Self {
        Self { topology, minor }
    }

    /// Next batch version at the same topology version
    pub fn next_minor(self) -> Self {
        Self {
            topology: self.topology,
            minor: self.minor.saturating_add(1),
        }
    }
}

impl fmt::Display for RoundVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.topology, self.minor)
    }
}

/// A request queued in a round, with the member that submitted it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundEntry {
    /// The request
    pub request: ChangeRequest,
    /// Member waiting for the decision
    pub submitter: NodeId,
    /// Rounds this entry already went through without a decision
    pub attempts: u32,
}

impl RoundEntry {
    /// Entry for a freshly admitted request
    pub fn new(request: ChangeRequest, submitter: NodeId) -> Self {
        Self {
            request,
            submitter,
            attempts: 0,
        }
    }

    /// Deployment id of the request
    pub fn deployment_id(&self) -> &DeploymentId {
        self.request.deployment_id()
    }
}

/// Lifecycle state of a round on the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Requests are being queued; not yet broadcast
    Collecting,
    /// Prepared and waiting for votes
    Finalizing,
    /// Decided and committed
    Done,
    /// Broken by a structural protocol error
    Rejected,
}

/// A round driven by the coordinator
#[derive(Debug, Clone)]
pub struct ExchangeRound {
    version: RoundVersion,
    participants: BTreeSet<NodeId>,
    entries: Vec<RoundEntry>,
    votes: BTreeMap<NodeId, Vec<Outcome>>,
    adopted: Option<Vec<Outcome>>,
    state: RoundState,
}

impl ExchangeRound {
    /// Open a round over a frozen participant set
    pub fn new(
        version: RoundVersion,
        participants: BTreeSet<NodeId>,
        entries: Vec<RoundEntry>,
    ) -> Self {
        Self {
            version,
            participants,
            entries,
            votes: BTreeMap::new(),
            adopted: None,
            state: RoundState::Collecting,
        }
    }

    /// Round version
    pub fn version(&self) -> RoundVersion {
        self.version
    }

    /// Members that must answer
    pub fn participants(&self) -> &BTreeSet<NodeId> {
        &self.participants
    }

    /// Queued entries in batch order
    pub fn entries(&self) -> &[RoundEntry] {
        &self.entries
    }

    /// Take the entries out of the round
    pub fn into_entries(self) -> Vec<RoundEntry> {
        self.entries
    }

    /// Current state
    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Mark the round as broadcast
    pub fn mark_prepared(&mut self) {
        self.state = RoundState::Finalizing;
    }

    /// Mark the round as broken
    pub fn mark_rejected(&mut self) {
        self.state = RoundState::Rejected;
    }

    /// Whether the entry with this id belongs to the round
    pub fn contains(&self, id: &DeploymentId) -> bool {
        self.entries.iter().any(|e| e.deployment_id() == id)
    }

    /// Record the per-entry votes of one participant
    pub fn record_vote(&mut self, from: NodeId, votes: Vec<Outcome>) -> ExchangeResult<()> {
        if !self.participants.contains(&from) {
            return Err(Error::protocol(format!(
                "vote for round {} from non-participant {}",
                self.version, from
            )));
        }

        if votes.len() != self.entries.len() {
            return Err(Error::protocol(format!(
                "round {} has {} entries but {} sent {} votes",
                self.version,
                self.entries.len(),
                from,
                votes.len()
            )));
        }

        self.votes.insert(from, votes);
        Ok(())
    }

    /// Adopt outcomes a participant already committed under an earlier
    /// coordinator
    pub fn adopt(&mut self, ids: &[DeploymentId], outcomes: Vec<Outcome>) -> ExchangeResult<()> {
        let matches = ids.len() == self.entries.len()
            && outcomes.len() == self.entries.len()
            && ids
                .iter()
                .zip(&self.entries)
                .all(|(id, entry)| id == entry.deployment_id());

        if !matches {
            return Err(Error::protocol(format!(
                "committed outcomes for round {} do not match its entries",
                self.version
            )));
        }

        self.adopted = Some(outcomes);
        Ok(())
    }

    /// Drop a participant that left the topology
    pub fn remove_participant(&mut self, node_id: &NodeId) -> bool {
        self.votes.remove(node_id);
        self.participants.remove(node_id)
    }

    /// Whether every participant answered, or committed outcomes were adopted
    pub fn is_complete(&self) -> bool {
        self.adopted.is_some()
            || self
                .participants
                .iter()
                .all(|node| self.votes.contains_key(node))
    }

    /// Compute the final per-entry outcomes and mark the round done
    pub fn decide(&mut self) -> Vec<Outcome> {
        self.state = RoundState::Done;

        if let Some(adopted) = &self.adopted {
            return adopted.clone();
        }

        (0..self.entries.len())
            .map(|i| {
                Outcome::combine(
                    self.participants
                        .iter()
                        .filter_map(|node| self.votes.get(node))
                        .filter_map(|votes| votes.get(i)),
                )
            })
            .collect()
    }
}

/// Validate a batch in order against a registry view.
///
/// Each accepted start or stop changes the view seen by later entries of the
/// same batch. Among several starts for one name, only the one with the
/// smallest deployment id may be accepted; the others get `NameConflict`.
pub fn validate_batch(entries: &[RoundEntry], exists: impl Fn(&str) -> bool) -> Vec<Outcome> {
    let mut winners: HashMap<&str, &DeploymentId> = HashMap::new();
    for entry in entries.iter().filter(|e| e.request.is_start()) {
        let id = entry.deployment_id();
        winners
            .entry(entry.request.resource_name())
            .and_modify(|winner| {
                if id < *winner {
                    *winner = id;
                }
            })
            .or_insert(id);
    }

    let mut overlay: HashMap<&str, bool> = HashMap::new();
    entries
        .iter()
        .map(|entry| {
            let request = &entry.request;
            if let Err(reason) = request.validate() {
                return Outcome::Rejected(reason);
            }

            let name = request.resource_name();
            let present = overlay.get(name).copied().unwrap_or_else(|| exists(name));

            match request {
                ChangeRequest::Start { deployment_id, .. } => {
                    if winners.get(name) != Some(&deployment_id) || present {
                        Outcome::Rejected(RejectReason::NameConflict)
                    } else {
                        overlay.insert(name, true);
                        Outcome::Accepted
                    }
                }
                ChangeRequest::Stop { .. } => {
                    if present {
                        overlay.insert(name, false);
                        Outcome::Accepted
                    } else {
                        Outcome::Rejected(RejectReason::NotFound)
                    }
                }
                ChangeRequest::ClientAttach { .. } => {
                    if present {
                        Outcome::Accepted
                    } else {
                        Outcome::Rejected(RejectReason::NotFound)
                    }
                }
            }
        })
        .collect()
}
