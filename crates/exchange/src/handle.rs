//! Submission API of one member

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use cachex_topology::NodeId;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::config::ExchangeConfig;
use crate::decision::Decision;
use crate::error::{Error, ExchangeResult};
use crate::events::ExchangeEvent;
use crate::registry::{LocalResourceRegistry, ResourceDescriptor};
use crate::request::{ChangeRequest, DeploymentId};
use crate::round::RoundVersion;

/// Commands sent from handles to the service task
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        request: ChangeRequest,
        reply: oneshot::Sender<ExchangeResult<oneshot::Receiver<Decision>>>,
    },
    Withdraw {
        deployment_id: DeploymentId,
        reply: oneshot::Sender<bool>,
    },
}

/// Point-in-time view of a member's exchange state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeStatus {
    /// Member this status belongs to
    pub node_id: NodeId,
    /// Topology version the member has processed
    pub topology_version: u64,
    /// Current coordinator, if any member is alive
    pub coordinator: Option<NodeId>,
    /// Last round committed here
    pub last_committed: Option<RoundVersion>,
    /// Round this member is coordinating, if any
    pub in_flight: Option<RoundVersion>,
    /// Requests queued for the next round, on the coordinator
    pub queued: usize,
    /// Requests submitted here still waiting for a decision
    pub outstanding: usize,
}

impl ExchangeStatus {
    /// Whether this member is the coordinator
    pub fn is_coordinator(&self) -> bool {
        self.coordinator == Some(self.node_id)
    }
}

/// Decision of a submitted request, resolved once the cluster decided it
#[derive(Debug)]
pub struct PendingDecision {
    deployment_id: DeploymentId,
    receiver: oneshot::Receiver<Decision>,
}

impl PendingDecision {
    /// Id of the submitted request
    pub fn deployment_id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    /// Wait at most `duration` for the decision
    pub async fn wait_timeout(self, duration: Duration) -> ExchangeResult<Decision> {
        let id = self.deployment_id.clone();
        timeout(duration, self)
            .await
            .map_err(|_| Error::timeout(format!("no decision for {id} within {duration:?}")))?
    }
}

impl Future for PendingDecision {
    type Output = ExchangeResult<Decision>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| Error::shutdown("exchange service stopped")))
    }
}

/// Cloneable handle to the exchange service of one member
#[derive(Debug, Clone)]
pub struct ExchangeHandle {
    node_id: NodeId,
    config: Arc<ExchangeConfig>,
    commands: mpsc::Sender<Command>,
    registry: Arc<LocalResourceRegistry>,
    events: broadcast::Sender<ExchangeEvent>,
    status: watch::Receiver<ExchangeStatus>,
}

impl ExchangeHandle {
    pub(crate) fn new(
        node_id: NodeId,
        config: Arc<ExchangeConfig>,
        commands: mpsc::Sender<Command>,
        registry: Arc<LocalResourceRegistry>,
        events: broadcast::Sender<ExchangeEvent>,
        status: watch::Receiver<ExchangeStatus>,
    ) -> Self {
        Self {
            node_id,
            config,
            commands,
            registry,
            events,
            status,
        }
    }

    /// Member this handle submits through
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Submit a request.
    ///
    /// Returns once the request is queued and forwarded to the coordinator;
    /// await the returned `PendingDecision` for the outcome.
    pub async fn submit(&self, request: ChangeRequest) -> ExchangeResult<PendingDecision> {
        let deployment_id = request.deployment_id().clone();
        let (reply, response) = oneshot::channel();
        let enqueue_timeout = self.config.enqueue_timeout;

        timeout(
            enqueue_timeout,
            self.commands.send(Command::Submit { request, reply }),
        )
        .await
        .map_err(|_| Error::timeout(format!("submitting {deployment_id} timed out")))?
        .map_err(|_| Error::shutdown("exchange service stopped"))?;

        let receiver = timeout(enqueue_timeout, response)
            .await
            .map_err(|_| Error::timeout(format!("enqueueing {deployment_id} timed out")))?
            .map_err(|_| Error::shutdown("exchange service stopped"))??;

        Ok(PendingDecision {
            deployment_id,
            receiver,
        })
    }

    /// Submit a request and wait for its decision
    pub async fn submit_and_wait(&self, request: ChangeRequest) -> ExchangeResult<Decision> {
        self.submit(request).await?.await
    }

    /// Withdraw a request that is not yet part of an opened round.
    ///
    /// Returns `false` once the request entered a round or was decided.
    pub async fn withdraw(&self, deployment_id: &DeploymentId) -> ExchangeResult<bool> {
        let (reply, response) = oneshot::channel();
        let command = Command::Withdraw {
            deployment_id: deployment_id.clone(),
            reply,
        };

        let exchange = async {
            self.commands
                .send(command)
                .await
                .map_err(|_| Error::shutdown("exchange service stopped"))?;
            response
                .await
                .map_err(|_| Error::shutdown("exchange service stopped"))
        };

        timeout(self.config.withdraw_timeout, exchange)
            .await
            .map_err(|_| Error::timeout(format!("withdrawing {deployment_id} timed out")))?
    }

    /// Local descriptor of a resource
    pub fn lookup(&self, name: &str) -> Option<ResourceDescriptor> {
        self.registry.lookup(name)
    }

    /// All local descriptors, sorted by name
    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        self.registry.list()
    }

    /// Current exchange status of this member
    pub fn status(&self) -> ExchangeStatus {
        self.status.borrow().clone()
    }

    /// Watch the exchange status of this member
    pub fn watch_status(&self) -> watch::Receiver<ExchangeStatus> {
        self.status.clone()
    }

    /// Subscribe to exchange events of this member
    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }
}
