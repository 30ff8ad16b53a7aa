//! Votes, round outcomes and the decisions reported to submitters

use std::fmt;

use cachex_topology::NodeId;
use serde::{Deserialize, Serialize};

use crate::error::ApplyError;

/// Why a request was rejected cluster-wide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The request failed validation before entering a round
    MalformedRequest(String),
    /// A live resource with this name already exists, or a competing start
    /// with a smaller deployment id won the round
    NameConflict,
    /// The target resource does not exist
    NotFound,
    /// The submitter withdrew the request before a round opened
    Withdrawn,
    /// The round hit a structural error and the request was not re-queued
    Aborted,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MalformedRequest(msg) => write!(f, "malformed request: {}", msg),
            RejectReason::NameConflict => write!(f, "name conflict"),
            RejectReason::NotFound => write!(f, "not found"),
            RejectReason::Withdrawn => write!(f, "withdrawn"),
            RejectReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Per-request result of a round, as voted by one participant or as decided
/// by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Request may be applied
    Accepted,
    /// Request must not be applied
    Rejected(RejectReason),
}

impl Outcome {
    /// Whether the request is accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted)
    }

    /// Combine the votes of every participant for one request.
    ///
    /// Accepted only if every vote accepts; otherwise the first rejection in
    /// participant order wins.
    pub fn combine<'a>(votes: impl IntoIterator<Item = &'a Outcome>) -> Outcome {
        votes
            .into_iter()
            .find(|vote| !vote.is_accepted())
            .cloned()
            .unwrap_or(Outcome::Accepted)
    }
}

/// A member that failed to apply an accepted request locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFailure {
    /// Member that failed
    pub node_id: NodeId,
    /// What went wrong
    pub error: ApplyError,
}

/// Final answer delivered to the submitter of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Applied on every member
    Accepted,
    /// Accepted cluster-wide but some members failed to apply it locally
    PartiallyAccepted {
        /// Per-member failures, in member order
        failures: Vec<LocalFailure>,
    },
    /// Not applied anywhere
    Rejected(RejectReason),
}

impl Decision {
    /// Whether the request took effect in the cluster
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Decision::Accepted | Decision::PartiallyAccepted { .. }
        )
    }

    /// Rejection reason, if rejected
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Decision::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Accepted => write!(f, "accepted"),
            Decision::PartiallyAccepted { failures } => {
                write!(f, "partially accepted ({} local failures)", failures.len())
            }
            Decision::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}
