//! Events emitted by the exchange service

use cachex_topology::NodeId;

use crate::decision::Decision;
use crate::error::ApplyError;
use crate::request::{DeploymentId, RequestKind};
use crate::round::RoundVersion;

/// Events emitted by the exchange service of one member
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    /// A request was accepted for submission on this member
    RequestSubmitted {
        /// Id of the submitted request
        deployment_id: DeploymentId,
        /// Request variant
        kind: RequestKind,
        /// Resource the request targets
        name: String,
    },

    /// This member opened a round as coordinator
    RoundOpened {
        /// Version of the new round
        version: RoundVersion,
        /// Number of frozen participants
        participants: usize,
        /// Number of batched requests
        entries: usize,
    },

    /// A round was committed on this member
    RoundCommitted {
        /// Committed round
        version: RoundVersion,
        /// Entries accepted by every participant
        accepted: usize,
        /// Entries rejected by at least one participant
        rejected: usize,
    },

    /// A round was broken by a protocol error and its requests re-queued
    RoundRejected {
        /// Broken round
        version: RoundVersion,
        /// Protocol error that broke it
        reason: String,
    },

    /// A resource was started locally
    ResourceStarted {
        /// Resource name
        name: String,
        /// Request that created it
        deployment_id: DeploymentId,
    },

    /// A resource was stopped locally
    ResourceStopped {
        /// Resource name
        name: String,
    },

    /// A client projection was registered locally
    ClientAttached {
        /// Resource the client attached to
        name: String,
        /// Member hosting the client
        origin_node: NodeId,
    },

    /// A cluster-accepted request failed to apply locally
    LocalApplyFailed {
        /// Request that failed
        deployment_id: DeploymentId,
        /// Local failure
        error: ApplyError,
    },

    /// A joining member received the cluster state
    StateInstalled {
        /// Round the state was handed over with
        version: RoundVersion,
        /// Number of resources installed
        resources: usize,
    },

    /// The coordinator changed
    CoordinatorChanged {
        /// Previous coordinator
        from: Option<NodeId>,
        /// New coordinator
        to: Option<NodeId>,
    },

    /// A submitter received its decision
    DecisionDelivered {
        /// Decided request
        deployment_id: DeploymentId,
        /// Final decision
        decision: Decision,
    },
}
