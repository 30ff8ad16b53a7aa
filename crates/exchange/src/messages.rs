//! Wire messages exchanged between members

use std::collections::BTreeSet;

use bytes::Bytes;
use cachex_topology::NodeId;
use serde::{Deserialize, Serialize};

use crate::decision::Outcome;
use crate::dedup::DedupRecord;
use crate::error::{ApplyError, Error, ExchangeResult};
use crate::registry::RegistrySnapshot;
use crate::request::{ChangeRequest, DeploymentId};
use crate::round::{RoundEntry, RoundVersion};

/// Message type tag used on the transport
pub const MESSAGE_TYPE: &str = "cache_exchange";

/// State handed to a member that has not yet seen any round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransfer {
    /// Registry contents of the coordinator
    pub registry: RegistrySnapshot,
    /// Deduplication history of the coordinator
    pub history: Vec<DedupRecord>,
    /// Last round the coordinator committed
    pub last_committed: Option<RoundVersion>,
}

/// Outcomes a participant committed for a round, echoed to a new coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedRound {
    /// Entry ids in batch order
    pub ids: Vec<DeploymentId>,
    /// Committed outcome per entry
    pub outcomes: Vec<Outcome>,
}

/// Exchange protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeMessage {
    /// Submitter to coordinator: queue these requests
    Forward {
        /// Requests in submission order
        requests: Vec<ChangeRequest>,
        /// Topology version the submitter picked the coordinator from
        topology: u64,
    },

    /// Submitter to coordinator: drop a queued request
    Withdraw {
        /// Request to drop
        deployment_id: DeploymentId,
    },

    /// Coordinator to submitter: answer to a withdrawal
    WithdrawAck {
        /// Request the answer is for
        deployment_id: DeploymentId,
        /// Whether the request was still queued and is now dropped
        withdrawn: bool,
    },

    /// Coordinator to submitter: decision reached outside a round the
    /// submitter takes part in
    Resolved {
        /// Request the decision is for
        deployment_id: DeploymentId,
        /// Decided outcome
        outcome: Outcome,
    },

    /// Coordinator to participants: validate this batch
    Prepare {
        /// Round version
        version: RoundVersion,
        /// Frozen participant set
        participants: BTreeSet<NodeId>,
        /// Entries in batch order
        entries: Vec<RoundEntry>,
        /// State for a member that joined since the last round
        sync: Option<Box<StateTransfer>>,
    },

    /// Participant to coordinator: per-entry votes
    Vote {
        /// Round version
        version: RoundVersion,
        /// One vote per entry
        votes: Vec<Outcome>,
        /// Set when the participant already committed this round
        committed: Option<CommittedRound>,
    },

    /// Coordinator to participants: apply these outcomes
    Commit {
        /// Round version
        version: RoundVersion,
        /// Participants the decision was reached with
        participants: BTreeSet<NodeId>,
        /// Entries in batch order
        entries: Vec<RoundEntry>,
        /// One outcome per entry
        outcomes: Vec<Outcome>,
    },

    /// Participant to submitter: local apply results of accepted entries
    Applied {
        /// Round version
        version: RoundVersion,
        /// Result per accepted entry of this submitter
        results: Vec<(DeploymentId, Option<ApplyError>)>,
    },
}

impl ExchangeMessage {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ExchangeMessage::Forward { .. } => "forward",
            ExchangeMessage::Withdraw { .. } => "withdraw",
            ExchangeMessage::WithdrawAck { .. } => "withdraw_ack",
            ExchangeMessage::Resolved { .. } => "resolved",
            ExchangeMessage::Prepare { .. } => "prepare",
            ExchangeMessage::Vote { .. } => "vote",
            ExchangeMessage::Commit { .. } => "commit",
            ExchangeMessage::Applied { .. } => "applied",
        }
    }

    /// Encode as CBOR
    pub fn encode(&self) -> ExchangeResult<Bytes> {
        let mut buffer = Vec::new();
        ciborium::ser::into_writer(self, &mut buffer)?;
        Ok(Bytes::from(buffer))
    }
}

impl TryFrom<Bytes> for ExchangeMessage {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Ok(ciborium::de::from_reader(bytes.as_ref())?)
    }
}

impl TryInto<Bytes> for ExchangeMessage {
    type Error = Error;

    fn try_into(self) -> Result<Bytes, Self::Error> {
        self.encode()
    }
}
