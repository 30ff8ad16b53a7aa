//! The per-member exchange actor.
//!
//! One task per member owns all protocol state. Commands from handles,
//! inbound envelopes, topology snapshots and the batching timer are all
//! handled from a single `select!` loop, so rounds are strictly ordered.
//!
//! Every member plays up to three parts:
//! - submitter: forwards its requests to the coordinator and collects apply
//!   reports until it can answer the waiting `PendingDecision`s;
//! - participant: votes on prepared batches and applies committed ones;
//! - coordinator (oldest member only): batches requests, opens rounds,
//!   combines votes and broadcasts the commit.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use cachex_topology::{NodeId, TopologySnapshot, TopologySubscription};
use cachex_transport::{Transport, TransportEnvelope};
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, ExchangeCheckpoint};
use crate::config::ExchangeConfig;
use crate::decision::{Decision, LocalFailure, Outcome, RejectReason};
use crate::dedup::RequestDeduplicator;
use crate::error::{ApplyError, Error};
use crate::events::ExchangeEvent;
use crate::handle::{Command, ExchangeStatus};
use crate::messages::{CommittedRound, ExchangeMessage, MESSAGE_TYPE, StateTransfer};
use crate::registry::LocalResourceRegistry;
use crate::request::{ChangeRequest, DeploymentId};
use crate::round::{ExchangeRound, RoundEntry, RoundVersion};

/// Rounds an entry may be re-queued through after structural failures
const MAX_ROUND_ATTEMPTS: u32 = 3;

type Incoming = Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>>;

/// A batch this member voted on but has not committed yet
#[derive(Debug, Clone)]
struct PreparedRound {
    version: RoundVersion,
    participants: BTreeSet<NodeId>,
    entries: Vec<RoundEntry>,
}

/// The last round this member committed
#[derive(Debug, Clone)]
struct CommittedState {
    version: RoundVersion,
    participants: BTreeSet<NodeId>,
    entries: Vec<RoundEntry>,
    outcomes: Vec<Outcome>,
}

/// A request submitted here that has no decision yet
#[derive(Debug)]
struct Outstanding {
    request: ChangeRequest,
    waiters: Vec<oneshot::Sender<Decision>>,
    in_round: bool,
}

/// An accepted request waiting for apply reports from every participant
#[derive(Debug, Default)]
struct AwaitingReports {
    expected: Option<BTreeSet<NodeId>>,
    reported: BTreeMap<NodeId, Option<ApplyError>>,
    waiters: Vec<oneshot::Sender<Decision>>,
}

/// A forward sent by a submitter whose topology is ahead of ours
#[derive(Debug)]
struct DeferredForward {
    topology: u64,
    submitter: NodeId,
    request: ChangeRequest,
}

/// Channels the service talks to the outside world through
pub(crate) struct ServiceChannels {
    pub incoming: Incoming,
    pub commands: mpsc::Receiver<Command>,
    pub topology: TopologySubscription,
}

/// Exchange state machine of one member
pub(crate) struct ExchangeService<T: Transport> {
    node_id: NodeId,
    config: ExchangeConfig,
    transport: Arc<T>,
    registry: Arc<LocalResourceRegistry>,
    checkpoint: Option<Arc<dyn CheckpointStore>>,
    events: broadcast::Sender<ExchangeEvent>,
    status: watch::Sender<ExchangeStatus>,

    topology: TopologySnapshot,
    dedup: RequestDeduplicator,
    /// Members that joined and have not committed a round yet
    unsynced: BTreeSet<NodeId>,
    /// Rounds at or below this version were committed before a restart
    fence: Option<RoundVersion>,

    // Coordinator
    collecting: VecDeque<RoundEntry>,
    deferred: Vec<DeferredForward>,
    in_flight: Option<ExchangeRound>,
    topology_round_pending: bool,
    batch_deadline: Option<Instant>,
    batch_ready: bool,
    await_topology_advance: bool,
    last_opened: Option<RoundVersion>,
    last_decided: Option<RoundVersion>,

    // Participant
    prepared: Option<PreparedRound>,
    last_committed: Option<CommittedState>,

    // Submitter
    outstanding: Vec<Outstanding>,
    awaiting: HashMap<DeploymentId, AwaitingReports>,
    withdrawals: HashMap<DeploymentId, Vec<oneshot::Sender<bool>>>,
}

impl<T: Transport> ExchangeService<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: NodeId,
        config: ExchangeConfig,
        transport: Arc<T>,
        registry: Arc<LocalResourceRegistry>,
        checkpoint: Option<Arc<dyn CheckpointStore>>,
        restored: Option<ExchangeCheckpoint>,
        topology: TopologySnapshot,
        events: broadcast::Sender<ExchangeEvent>,
        status: watch::Sender<ExchangeStatus>,
    ) -> Self {
        let mut dedup = RequestDeduplicator::new(config.dedup_history_limit);
        let mut fence = None;

        if let Some(restored) = restored {
            info!(
                "Node {} restoring checkpoint at round {} with {} applied resources",
                node_id,
                restored.last_finalized,
                restored.applied.len()
            );
            for deployment_id in restored.applied.into_values() {
                dedup.record(deployment_id, restored.last_finalized, Outcome::Accepted);
            }
            fence = Some(restored.last_finalized);
        }

        Self {
            node_id,
            config,
            transport,
            registry,
            checkpoint,
            events,
            status,
            topology,
            dedup,
            unsynced: BTreeSet::new(),
            fence,
            collecting: VecDeque::new(),
            deferred: Vec::new(),
            in_flight: None,
            topology_round_pending: false,
            batch_deadline: None,
            batch_ready: false,
            await_topology_advance: false,
            last_opened: None,
            last_decided: None,
            prepared: None,
            last_committed: None,
            outstanding: Vec::new(),
            awaiting: HashMap::new(),
            withdrawals: HashMap::new(),
        }
    }

    /// Run until `shutdown` is cancelled
    pub(crate) async fn run(mut self, channels: ServiceChannels, shutdown: CancellationToken) {
        let ServiceChannels {
            mut incoming,
            mut commands,
            mut topology,
        } = channels;
        let mut topology_open = true;

        info!(
            "Exchange service started on node {} at topology version {}",
            self.node_id,
            self.topology.version()
        );
        self.publish_status();

        loop {
            let deadline = self.batch_deadline;

            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(command) = commands.recv() => {
                    self.handle_command(command).await;
                }

                Some(envelope) = incoming.next() => {
                    self.handle_envelope(envelope).await;
                }

                changed = topology.changed(), if topology_open => match changed {
                    Ok(()) => {
                        let snapshot = topology.latest();
                        self.handle_topology(snapshot).await;
                    }
                    Err(e) => {
                        warn!("Node {} lost its topology source: {}", self.node_id, e);
                        topology_open = false;
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.batch_deadline = None;
                    self.batch_ready = !self.collecting.is_empty();
                }
            }

            self.maybe_open_round().await;
            self.publish_status();
        }

        info!(
            "Exchange service stopped on node {} ({} requests left undecided)",
            self.node_id,
            self.outstanding.len() + self.awaiting.len()
        );
    }

    // ---------------------------------------------------------------------
    // Submitter side
    // ---------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { request, reply } => {
                let (sender, receiver) = oneshot::channel();
                self.submit(request, sender).await;
                let _ = reply.send(Ok(receiver));
            }
            Command::Withdraw {
                deployment_id,
                reply,
            } => self.withdraw(deployment_id, reply).await,
        }
    }

    async fn submit(&mut self, request: ChangeRequest, waiter: oneshot::Sender<Decision>) {
        let id = request.deployment_id().clone();

        if let Err(reason) = request.validate() {
            debug!("Node {} rejecting malformed request {}", self.node_id, request);
            self.deliver(id, Decision::Rejected(reason), vec![waiter]);
            return;
        }

        if let Some(outcome) = self.dedup.outcome(&id).cloned() {
            debug!(
                "Node {} answering replayed request {} from history",
                self.node_id, id
            );
            self.deliver(id, decision_for(outcome), vec![waiter]);
            return;
        }

        if let Some(outstanding) = self
            .outstanding
            .iter_mut()
            .find(|o| o.request.deployment_id() == &id)
        {
            outstanding.waiters.push(waiter);
            return;
        }

        if let Some(awaiting) = self.awaiting.get_mut(&id) {
            awaiting.waiters.push(waiter);
            return;
        }

        debug!("Node {} submitting {}", self.node_id, request);
        self.emit(ExchangeEvent::RequestSubmitted {
            deployment_id: id,
            kind: request.kind(),
            name: request.resource_name().to_string(),
        });

        self.outstanding.push(Outstanding {
            request: request.clone(),
            waiters: vec![waiter],
            in_round: false,
        });
        self.forward(vec![request]).await;
    }

    async fn withdraw(&mut self, id: DeploymentId, reply: oneshot::Sender<bool>) {
        let withdrawable = self
            .outstanding
            .iter()
            .any(|o| o.request.deployment_id() == &id && !o.in_round);

        let coordinator = self.topology.coordinator();
        match coordinator {
            Some(coordinator) if withdrawable => {
                self.withdrawals.entry(id.clone()).or_default().push(reply);
                self.send(coordinator, &ExchangeMessage::Withdraw { deployment_id: id })
                    .await;
            }
            _ => {
                let _ = reply.send(false);
            }
        }
    }

    async fn forward(&mut self, requests: Vec<ChangeRequest>) {
        if requests.is_empty() {
            return;
        }

        match self.topology.coordinator() {
            Some(coordinator) => {
                debug!(
                    "Node {} forwarding {} requests to coordinator {}",
                    self.node_id,
                    requests.len(),
                    coordinator
                );
                let topology = self.topology.version();
                self.send(coordinator, &ExchangeMessage::Forward { requests, topology })
                    .await;
            }
            None => warn!(
                "Node {} has no coordinator; {} requests wait for the next topology",
                self.node_id,
                requests.len()
            ),
        }
    }

    /// Send every undecided request and withdrawal to the current coordinator
    async fn reforward(&mut self) {
        let requests: Vec<ChangeRequest> =
            self.outstanding.iter().map(|o| o.request.clone()).collect();
        self.forward(requests).await;

        if let Some(coordinator) = self.topology.coordinator() {
            let pending: Vec<DeploymentId> = self.withdrawals.keys().cloned().collect();
            for deployment_id in pending {
                self.send(coordinator, &ExchangeMessage::Withdraw { deployment_id })
                    .await;
            }
        }
    }

    fn handle_withdraw_ack(&mut self, id: DeploymentId, withdrawn: bool) {
        if withdrawn {
            if let Some(pos) = self.position(&id) {
                let outstanding = self.outstanding.remove(pos);
                info!("Node {} withdrew request {}", self.node_id, id);
                self.deliver(
                    id.clone(),
                    Decision::Rejected(RejectReason::Withdrawn),
                    outstanding.waiters,
                );
            }
        }

        for reply in self.withdrawals.remove(&id).unwrap_or_default() {
            let _ = reply.send(withdrawn);
        }
    }

    fn handle_resolved(&mut self, id: DeploymentId, outcome: Outcome) {
        let Some(pos) = self.position(&id) else {
            debug!(
                "Node {} ignoring resolution of unknown request {}",
                self.node_id, id
            );
            return;
        };

        let mut waiters = self.outstanding.remove(pos).waiters;
        // Reports that overtook the commit are moot now.
        if let Some(awaiting) = self.awaiting.remove(&id) {
            waiters.extend(awaiting.waiters);
        }
        self.fail_withdrawals(&id);
        self.deliver(id, decision_for(outcome), waiters);
    }

    /// Move an own entry out of `outstanding` once its round committed
    fn on_own_commit(
        &mut self,
        entry: &RoundEntry,
        outcome: &Outcome,
        participants: &BTreeSet<NodeId>,
    ) {
        let id = entry.deployment_id().clone();
        let Some(pos) = self.position(&id) else {
            return;
        };
        let outstanding = self.outstanding.remove(pos);
        self.fail_withdrawals(&id);

        match outcome {
            Outcome::Rejected(reason) => {
                self.deliver(id, Decision::Rejected(reason.clone()), outstanding.waiters);
            }
            Outcome::Accepted => {
                let expected: BTreeSet<NodeId> = participants
                    .iter()
                    .filter(|node| self.topology.contains(node))
                    .copied()
                    .collect();
                let awaiting = self.awaiting.entry(id.clone()).or_default();
                awaiting.expected = Some(expected);
                awaiting.waiters.extend(outstanding.waiters);
                self.try_complete(&id);
            }
        }
    }

    fn handle_applied(&mut self, from: NodeId, results: Vec<(DeploymentId, Option<ApplyError>)>) {
        for (id, result) in results {
            if let Some(awaiting) = self.awaiting.get_mut(&id) {
                awaiting.reported.insert(from, result);
            } else if self.position(&id).is_some() {
                // Report overtook the commit on another link.
                let mut awaiting = AwaitingReports::default();
                awaiting.reported.insert(from, result);
                self.awaiting.insert(id.clone(), awaiting);
            } else {
                debug!(
                    "Node {} ignoring apply report for {} from {}",
                    self.node_id, id, from
                );
                continue;
            }
            self.try_complete(&id);
        }
    }

    fn try_complete(&mut self, id: &DeploymentId) {
        let complete = self.awaiting.get(id).is_some_and(|awaiting| {
            awaiting.expected.as_ref().is_some_and(|expected| {
                expected
                    .iter()
                    .all(|node| awaiting.reported.contains_key(node))
            })
        });
        if !complete {
            return;
        }

        let Some(awaiting) = self.awaiting.remove(id) else {
            return;
        };

        let failures: Vec<LocalFailure> = awaiting
            .reported
            .into_iter()
            .filter_map(|(node_id, result)| result.map(|error| LocalFailure { node_id, error }))
            .collect();

        let decision = if failures.is_empty() {
            Decision::Accepted
        } else {
            Decision::PartiallyAccepted { failures }
        };
        self.deliver(id.clone(), decision, awaiting.waiters);
    }

    fn deliver(
        &self,
        id: DeploymentId,
        decision: Decision,
        waiters: Vec<oneshot::Sender<Decision>>,
    ) {
        debug!("Node {} decided {}: {}", self.node_id, id, decision);
        for waiter in waiters {
            let _ = waiter.send(decision.clone());
        }
        self.emit(ExchangeEvent::DecisionDelivered {
            deployment_id: id,
            decision,
        });
    }

    fn fail_withdrawals(&mut self, id: &DeploymentId) {
        for reply in self.withdrawals.remove(id).unwrap_or_default() {
            let _ = reply.send(false);
        }
    }

    fn position(&self, id: &DeploymentId) -> Option<usize> {
        self.outstanding
            .iter()
            .position(|o| o.request.deployment_id() == id)
    }

    // ---------------------------------------------------------------------
    // Coordinator side
    // ---------------------------------------------------------------------

    fn is_coordinator(&self) -> bool {
        self.topology.coordinator() == Some(self.node_id)
    }

    async fn handle_forward(
        &mut self,
        submitter: NodeId,
        requests: Vec<ChangeRequest>,
        topology: u64,
    ) {
        if self.is_coordinator() {
            for request in requests {
                self.admit(request, submitter).await;
            }
            return;
        }

        if topology > self.topology.version() {
            debug!(
                "Node {} holding {} requests from {} until topology version {}",
                self.node_id,
                requests.len(),
                submitter,
                topology
            );
            self.deferred
                .extend(requests.into_iter().map(|request| DeferredForward {
                    topology,
                    submitter,
                    request,
                }));
            return;
        }

        // The submitter re-forwards once it sees the coordinator change.
        debug!(
            "Node {} is not coordinator; dropping {} requests from {} (topology {})",
            self.node_id,
            requests.len(),
            submitter,
            topology
        );
    }

    /// Admit or drop forwards whose topology version we have reached
    async fn release_deferred(&mut self) {
        let current = self.topology.version();
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .deferred
            .drain(..)
            .partition(|d| d.topology <= current);
        self.deferred = waiting;

        if ready.is_empty() {
            return;
        }
        if !self.is_coordinator() {
            debug!(
                "Node {} dropping {} held requests; not coordinator at topology {}",
                self.node_id,
                ready.len(),
                current
            );
            return;
        }
        for deferred in ready {
            self.admit(deferred.request, deferred.submitter).await;
        }
    }

    /// Resolve queued entries that history shows were already decided
    async fn drop_decided(&mut self) {
        let mut decided = Vec::new();
        let dedup = &self.dedup;
        self.collecting.retain(|entry| match dedup.outcome(entry.deployment_id()) {
            Some(outcome) => {
                decided.push((entry.clone(), outcome.clone()));
                false
            }
            None => true,
        });

        for (entry, outcome) in decided {
            debug!(
                "Node {} dropping already decided request {} from the queue",
                self.node_id,
                entry.deployment_id()
            );
            self.send(
                entry.submitter,
                &ExchangeMessage::Resolved {
                    deployment_id: entry.deployment_id().clone(),
                    outcome,
                },
            )
            .await;
        }
    }

    async fn admit(&mut self, request: ChangeRequest, submitter: NodeId) {
        let id = request.deployment_id().clone();

        if let Some(outcome) = self.dedup.outcome(&id).cloned() {
            debug!("Node {} dropping duplicate request {}", self.node_id, id);
            self.send(
                submitter,
                &ExchangeMessage::Resolved {
                    deployment_id: id,
                    outcome,
                },
            )
            .await;
            return;
        }

        if request.is_start()
            && self.registry.created_by(request.resource_name()).as_ref() == Some(&id)
        {
            debug!(
                "Node {} request {} already created '{}'",
                self.node_id,
                id,
                request.resource_name()
            );
            self.send(
                submitter,
                &ExchangeMessage::Resolved {
                    deployment_id: id,
                    outcome: Outcome::Accepted,
                },
            )
            .await;
            return;
        }

        let queued = self.collecting.iter().any(|e| e.deployment_id() == &id)
            || self.in_flight.as_ref().is_some_and(|r| r.contains(&id));
        if queued {
            debug!("Node {} request {} is already queued", self.node_id, id);
            return;
        }

        if let Err(reason) = request.validate() {
            self.send(
                submitter,
                &ExchangeMessage::Resolved {
                    deployment_id: id,
                    outcome: Outcome::Rejected(reason),
                },
            )
            .await;
            return;
        }

        debug!(
            "Node {} queued {} from {} for the next round",
            self.node_id, request, submitter
        );
        self.collecting
            .push_back(RoundEntry::new(request, submitter));

        if self.batch_deadline.is_none() && !self.batch_ready {
            self.batch_deadline = Some(Instant::now() + self.config.batch_window);
        }
    }

    async fn handle_withdraw(&mut self, id: DeploymentId, from: NodeId) {
        let before = self.collecting.len() + self.deferred.len();
        self.collecting.retain(|e| e.deployment_id() != &id);
        self.deferred.retain(|d| d.request.deployment_id() != &id);
        let withdrawn = self.collecting.len() + self.deferred.len() < before;

        if withdrawn {
            debug!("Node {} removed {} from the queue", self.node_id, id);
        }

        self.send(
            from,
            &ExchangeMessage::WithdrawAck {
                deployment_id: id,
                withdrawn,
            },
        )
        .await;
    }

    fn last_committed_version(&self) -> Option<RoundVersion> {
        self.last_committed.as_ref().map(|c| c.version)
    }

    fn next_version(&self) -> RoundVersion {
        let topology = self.topology.version();
        let floor = [
            self.last_committed_version(),
            self.last_opened,
            self.prepared.as_ref().map(|p| p.version),
            self.fence,
        ]
        .into_iter()
        .flatten()
        .max();

        let candidate = if self.topology_round_pending {
            RoundVersion::new(topology, 0)
        } else {
            match floor {
                Some(f) if f.topology == topology => f.next_minor(),
                _ => RoundVersion::new(topology, 1),
            }
        };

        match floor {
            Some(f) if candidate <= f => f.next_minor(),
            _ => candidate,
        }
    }

    async fn maybe_open_round(&mut self) {
        if !self.is_coordinator() || self.in_flight.is_some() {
            return;
        }

        // Our own commit must be applied before its state is handed out.
        if let Some(decided) = self.last_decided {
            if self.last_committed_version().is_none_or(|c| c < decided) {
                return;
            }
        }

        self.drop_decided().await;

        let batch_due =
            self.batch_ready && !self.collecting.is_empty() && !self.await_topology_advance;
        if !self.topology_round_pending && !batch_due {
            return;
        }

        let version = self.next_version();
        let entries: Vec<RoundEntry> = self.collecting.drain(..).collect();
        let participants = self.topology.node_ids();

        self.topology_round_pending = false;
        self.batch_ready = false;
        self.batch_deadline = None;
        self.last_opened = Some(version);

        info!(
            "Node {} opening round {} with {} entries over {} participants",
            self.node_id,
            version,
            entries.len(),
            participants.len()
        );
        self.emit(ExchangeEvent::RoundOpened {
            version,
            participants: participants.len(),
            entries: entries.len(),
        });

        let mut round = ExchangeRound::new(version, participants, entries);
        self.send_prepare(&mut round).await;
        self.in_flight = Some(round);
    }

    async fn send_prepare(&mut self, round: &mut ExchangeRound) {
        let needs_sync = round
            .participants()
            .iter()
            .any(|node| self.unsynced.contains(node));
        let sync = needs_sync.then(|| {
            Box::new(StateTransfer {
                registry: self.registry.snapshot(),
                history: self.dedup.export(),
                last_committed: self.last_committed_version(),
            })
        });

        for node in self.ordered(round.participants()) {
            let message = ExchangeMessage::Prepare {
                version: round.version(),
                participants: round.participants().clone(),
                entries: round.entries().to_vec(),
                sync: if self.unsynced.contains(&node) {
                    sync.clone()
                } else {
                    None
                },
            };
            self.send(node, &message).await;
        }

        round.mark_prepared();
    }

    async fn handle_vote(
        &mut self,
        from: NodeId,
        version: RoundVersion,
        votes: Vec<Outcome>,
        committed: Option<CommittedRound>,
    ) {
        let Some(round) = self.in_flight.as_mut() else {
            debug!(
                "Node {} ignoring vote for round {} from {}: no round in flight",
                self.node_id, version, from
            );
            return;
        };

        if round.version() != version {
            debug!(
                "Node {} ignoring vote for round {} from {}: round {} in flight",
                self.node_id,
                version,
                from,
                round.version()
            );
            return;
        }

        if !round.participants().contains(&from) {
            debug!(
                "Node {} ignoring vote for round {} from dropped participant {}",
                self.node_id, version, from
            );
            return;
        }

        let result = match committed {
            Some(committed) => {
                info!(
                    "Node {} adopting outcomes of round {} already committed by {}",
                    self.node_id, version, from
                );
                round.adopt(&committed.ids, committed.outcomes)
            }
            None => round.record_vote(from, votes),
        };

        let complete = result.is_ok() && round.is_complete();
        match result {
            Err(e) => self.reject_round(e).await,
            Ok(()) if complete => self.finalize_round().await,
            Ok(()) => {}
        }
    }

    async fn finalize_round(&mut self) {
        let Some(mut round) = self.in_flight.take() else {
            return;
        };

        let outcomes = round.decide();
        let version = round.version();
        let participants = round.participants().clone();
        let entries = round.into_entries();
        self.last_decided = Some(version);

        let accepted = outcomes.iter().filter(|o| o.is_accepted()).count();
        info!(
            "Node {} decided round {}: {} accepted, {} rejected",
            self.node_id,
            version,
            accepted,
            outcomes.len() - accepted
        );

        let commit = ExchangeMessage::Commit {
            version,
            participants: participants.clone(),
            entries: entries.clone(),
            outcomes: outcomes.clone(),
        };
        for node in self.ordered(&participants) {
            self.send(node, &commit).await;
        }

        // Submitters outside the round only learn the outcome.
        for (entry, outcome) in entries.iter().zip(outcomes) {
            if !participants.contains(&entry.submitter) {
                self.send(
                    entry.submitter,
                    &ExchangeMessage::Resolved {
                        deployment_id: entry.deployment_id().clone(),
                        outcome,
                    },
                )
                .await;
            }
        }
    }

    async fn reject_round(&mut self, error: Error) {
        let Some(mut round) = self.in_flight.take() else {
            return;
        };
        round.mark_rejected();
        let version = round.version();

        warn!(
            "Node {} rejected round {}: {}; re-queueing its requests",
            self.node_id, version, error
        );
        self.emit(ExchangeEvent::RoundRejected {
            version,
            reason: error.to_string(),
        });

        for mut entry in round.into_entries().into_iter().rev() {
            entry.attempts += 1;
            if entry.attempts >= MAX_ROUND_ATTEMPTS {
                warn!(
                    "Node {} aborting {} after {} failed rounds",
                    self.node_id,
                    entry.deployment_id(),
                    entry.attempts
                );
                self.send(
                    entry.submitter,
                    &ExchangeMessage::Resolved {
                        deployment_id: entry.deployment_id().clone(),
                        outcome: Outcome::Rejected(RejectReason::Aborted),
                    },
                )
                .await;
            } else {
                self.collecting.push_front(entry);
            }
        }

        self.await_topology_advance = true;
    }

    /// Become coordinator: finish what the previous coordinator left behind
    async fn take_over(&mut self) {
        let committed = self.last_committed_version();
        let pending = self
            .prepared
            .clone()
            .filter(|p| committed.is_none_or(|c| p.version > c));

        if let Some(prepared) = pending {
            let participants: BTreeSet<NodeId> = prepared
                .participants
                .iter()
                .filter(|node| self.topology.contains(node))
                .copied()
                .collect();

            info!(
                "Node {} restarting round {} with {} entries over {} participants",
                self.node_id,
                prepared.version,
                prepared.entries.len(),
                participants.len()
            );

            self.collecting.retain(|e| {
                !prepared
                    .entries
                    .iter()
                    .any(|p| p.deployment_id() == e.deployment_id())
            });
            self.last_opened = self.last_opened.max(Some(prepared.version));

            let mut round = ExchangeRound::new(prepared.version, participants, prepared.entries);
            self.send_prepare(&mut round).await;
            self.in_flight = Some(round);
            return;
        }

        // Members that only prepared our last round never saw its commit.
        if let Some(last) = self.last_committed.clone() {
            debug!(
                "Node {} re-broadcasting commit of round {}",
                self.node_id, last.version
            );
            let commit = ExchangeMessage::Commit {
                version: last.version,
                participants: last.participants.clone(),
                entries: last.entries,
                outcomes: last.outcomes,
            };
            let recipients: BTreeSet<NodeId> = last
                .participants
                .iter()
                .filter(|node| self.topology.contains(node) && **node != self.node_id)
                .copied()
                .collect();
            for node in self.ordered(&recipients) {
                self.send(node, &commit).await;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Participant side
    // ---------------------------------------------------------------------

    async fn handle_prepare(
        &mut self,
        from: NodeId,
        version: RoundVersion,
        participants: BTreeSet<NodeId>,
        entries: Vec<RoundEntry>,
        sync: Option<Box<StateTransfer>>,
    ) {
        if let Some(last) = &self.last_committed {
            if version == last.version {
                let committed = CommittedRound {
                    ids: last.entries.iter().map(|e| e.deployment_id().clone()).collect(),
                    outcomes: last.outcomes.clone(),
                };
                self.send(
                    from,
                    &ExchangeMessage::Vote {
                        version,
                        votes: Vec::new(),
                        committed: Some(committed),
                    },
                )
                .await;
                return;
            }
            if version < last.version {
                warn!(
                    "Node {} ignoring prepare for stale round {} from {} (committed {})",
                    self.node_id, version, from, last.version
                );
                return;
            }
        }

        if self.fence.is_some_and(|fence| version <= fence) {
            warn!(
                "Node {} ignoring prepare for round {} at or below its restored checkpoint",
                self.node_id, version
            );
            return;
        }

        if let Some(state) = sync {
            self.install_state(*state, version).await;
        }

        for entry in entries.iter().filter(|e| e.submitter == self.node_id) {
            if let Some(pos) = self.position(entry.deployment_id()) {
                self.outstanding[pos].in_round = true;
            }
        }

        let votes = self.registry.validate(&entries);
        debug!(
            "Node {} voting on round {} from {}: {:?}",
            self.node_id, version, from, votes
        );

        self.prepared = Some(PreparedRound {
            version,
            participants,
            entries,
        });

        self.send(
            from,
            &ExchangeMessage::Vote {
                version,
                votes,
                committed: None,
            },
        )
        .await;
    }

    async fn install_state(&mut self, state: StateTransfer, version: RoundVersion) {
        if state.last_committed < self.last_committed_version() {
            warn!(
                "Node {} ignoring state transfer older than its own commits",
                self.node_id
            );
            return;
        }

        let failures = self.registry.install(&state.registry).await;
        for failure in &failures {
            warn!(
                "Node {} failed to restore resource during state transfer: {}",
                self.node_id, failure
            );
        }

        let imported = self.dedup.import(state.history);
        self.fence = self.fence.max(state.last_committed);

        info!(
            "Node {} installed cluster state with {} resources and {} dedup records",
            self.node_id,
            state.registry.resources.len(),
            imported
        );
        self.emit(ExchangeEvent::StateInstalled {
            version,
            resources: state.registry.resources.len(),
        });
    }

    async fn handle_commit(
        &mut self,
        from: NodeId,
        version: RoundVersion,
        participants: BTreeSet<NodeId>,
        entries: Vec<RoundEntry>,
        outcomes: Vec<Outcome>,
    ) {
        if self.last_committed_version().is_some_and(|c| version <= c)
            || self.fence.is_some_and(|fence| version <= fence)
        {
            debug!(
                "Node {} ignoring commit of round {} from {}: already committed",
                self.node_id, version, from
            );
            return;
        }

        if entries.len() != outcomes.len() {
            warn!(
                "Node {} ignoring malformed commit of round {} from {}: {} entries, {} outcomes",
                self.node_id,
                version,
                from,
                entries.len(),
                outcomes.len()
            );
            return;
        }

        let mut reports: BTreeMap<NodeId, Vec<(DeploymentId, Option<ApplyError>)>> =
            BTreeMap::new();
        let mut accepted = 0;

        for (entry, outcome) in entries.iter().zip(&outcomes) {
            let id = entry.deployment_id();

            if outcome.is_accepted() {
                accepted += 1;
                let result = if self.dedup.seen(id) {
                    debug!("Node {} skipping already applied {}", self.node_id, id);
                    None
                } else {
                    self.apply_entry(entry).await.err()
                };
                reports
                    .entry(entry.submitter)
                    .or_default()
                    .push((id.clone(), result));
            }

            self.dedup.record(id.clone(), version, outcome.clone());
        }

        info!(
            "Node {} committed round {}: {} accepted, {} rejected",
            self.node_id,
            version,
            accepted,
            outcomes.len() - accepted
        );
        self.emit(ExchangeEvent::RoundCommitted {
            version,
            accepted,
            rejected: outcomes.len() - accepted,
        });

        if self.prepared.as_ref().is_some_and(|p| p.version <= version) {
            self.prepared = None;
        }
        for node in &participants {
            self.unsynced.remove(node);
        }

        for (entry, outcome) in entries.iter().zip(&outcomes) {
            if entry.submitter == self.node_id {
                self.on_own_commit(entry, outcome, &participants);
            }
        }

        self.last_committed = Some(CommittedState {
            version,
            participants,
            entries,
            outcomes,
        });
        self.save_checkpoint(version).await;

        for (submitter, results) in reports {
            self.send(submitter, &ExchangeMessage::Applied { version, results })
                .await;
        }
    }

    async fn apply_entry(&self, entry: &RoundEntry) -> Result<(), ApplyError> {
        let request = &entry.request;
        let result = self.registry.apply(request).await;

        match &result {
            Ok(()) => {
                let event = match request {
                    ChangeRequest::Start { deployment_id, config } => {
                        ExchangeEvent::ResourceStarted {
                            name: config.name.clone(),
                            deployment_id: deployment_id.clone(),
                        }
                    }
                    ChangeRequest::Stop { name, .. } => {
                        ExchangeEvent::ResourceStopped { name: name.clone() }
                    }
                    ChangeRequest::ClientAttach {
                        origin_node,
                        config,
                        ..
                    } => ExchangeEvent::ClientAttached {
                        name: config.name.clone(),
                        origin_node: *origin_node,
                    },
                };
                self.emit(event);
            }
            Err(e) => {
                warn!(
                    "Node {} failed to apply {} locally: {}",
                    self.node_id, request, e
                );
                self.emit(ExchangeEvent::LocalApplyFailed {
                    deployment_id: entry.deployment_id().clone(),
                    error: e.clone(),
                });
            }
        }

        result
    }

    async fn save_checkpoint(&self, version: RoundVersion) {
        let Some(store) = &self.checkpoint else {
            return;
        };

        let checkpoint = ExchangeCheckpoint {
            last_finalized: version,
            applied: self.registry.applied(),
        };
        if let Err(e) = store.save(&checkpoint).await {
            error!(
                "Node {} failed to save checkpoint at round {}: {}",
                self.node_id, version, e
            );
        }
    }

    // ---------------------------------------------------------------------
    // Topology
    // ---------------------------------------------------------------------

    async fn handle_topology(&mut self, snapshot: TopologySnapshot) {
        if snapshot.version() <= self.topology.version() {
            warn!(
                "Node {} ignoring non-advancing topology version {} (current {})",
                self.node_id,
                snapshot.version(),
                self.topology.version()
            );
            return;
        }

        let change = snapshot.diff(&self.topology);
        let previous_coordinator = self.topology.coordinator();
        self.topology = snapshot;
        let coordinator = self.topology.coordinator();

        info!(
            "Node {} moved to topology version {} ({} joined, {} left)",
            self.node_id,
            change.to_version,
            change.joined.len(),
            change.left.len()
        );

        for node in &change.left {
            self.unsynced.remove(node);
        }
        for node in change.joined.iter().filter(|n| **n != self.node_id) {
            self.unsynced.insert(*node);
        }

        self.dedup.evict_stale(self.topology.version());
        self.await_topology_advance = false;

        if let Some(round) = self.in_flight.as_mut() {
            for node in &change.left {
                if round.remove_participant(node) {
                    info!(
                        "Node {} dropped departed participant {} from round {}",
                        self.node_id,
                        node,
                        round.version()
                    );
                }
            }
        }

        let topology = &self.topology;
        for awaiting in self.awaiting.values_mut() {
            if let Some(expected) = awaiting.expected.as_mut() {
                expected.retain(|node| topology.contains(node));
            }
        }
        let ids: Vec<DeploymentId> = self.awaiting.keys().cloned().collect();
        for id in ids {
            self.try_complete(&id);
        }

        if previous_coordinator != coordinator {
            info!(
                "Node {} sees coordinator change {:?} -> {:?}",
                self.node_id, previous_coordinator, coordinator
            );
            self.emit(ExchangeEvent::CoordinatorChanged {
                from: previous_coordinator,
                to: coordinator,
            });

            if coordinator == Some(self.node_id) {
                self.take_over().await;
            } else {
                self.collecting.clear();
                self.in_flight = None;
                self.batch_deadline = None;
                self.batch_ready = false;
            }

            self.reforward().await;
        }

        self.release_deferred().await;
        self.topology_round_pending = self.is_coordinator();

        if self.in_flight.as_ref().is_some_and(|r| r.is_complete()) {
            self.finalize_round().await;
        }
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    async fn handle_envelope(&mut self, envelope: TransportEnvelope) {
        if envelope.message_type != MESSAGE_TYPE {
            debug!(
                "Node {} ignoring envelope of type {} from {}",
                self.node_id, envelope.message_type, envelope.sender
            );
            return;
        }

        let from = envelope.sender;
        let message = match ExchangeMessage::try_from(envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Node {} dropping undecodable message from {}: {}",
                    self.node_id, from, e
                );
                return;
            }
        };

        match message {
            ExchangeMessage::Forward { requests, topology } => {
                self.handle_forward(from, requests, topology).await;
            }
            ExchangeMessage::Withdraw { deployment_id } => {
                self.handle_withdraw(deployment_id, from).await;
            }
            ExchangeMessage::WithdrawAck {
                deployment_id,
                withdrawn,
            } => self.handle_withdraw_ack(deployment_id, withdrawn),
            ExchangeMessage::Resolved {
                deployment_id,
                outcome,
            } => self.handle_resolved(deployment_id, outcome),
            ExchangeMessage::Prepare {
                version,
                participants,
                entries,
                sync,
            } => {
                self.handle_prepare(from, version, participants, entries, sync)
                    .await;
            }
            ExchangeMessage::Vote {
                version,
                votes,
                committed,
            } => self.handle_vote(from, version, votes, committed).await,
            ExchangeMessage::Commit {
                version,
                participants,
                entries,
                outcomes,
            } => {
                self.handle_commit(from, version, participants, entries, outcomes)
                    .await;
            }
            ExchangeMessage::Applied { version, results } => {
                debug!(
                    "Node {} received {} apply reports for round {} from {}",
                    self.node_id,
                    results.len(),
                    version,
                    from
                );
                self.handle_applied(from, results);
            }
        }
    }

    /// Recipients in join order, this member first
    fn ordered(&self, nodes: &BTreeSet<NodeId>) -> Vec<NodeId> {
        let mut ordered = Vec::with_capacity(nodes.len());
        if nodes.contains(&self.node_id) {
            ordered.push(self.node_id);
        }
        for member in self.topology.members() {
            let node = *member.node_id();
            if node != self.node_id && nodes.contains(&node) {
                ordered.push(node);
            }
        }
        for node in nodes {
            if !ordered.contains(node) {
                ordered.push(*node);
            }
        }
        ordered
    }

    async fn send(&self, recipient: NodeId, message: &ExchangeMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Node {} failed to encode {}: {}",
                    self.node_id,
                    message.name(),
                    e
                );
                return;
            }
        };

        if let Err(e) = self
            .transport
            .send_envelope(&recipient, &payload, MESSAGE_TYPE)
            .await
        {
            warn!(
                "Node {} failed to send {} to {}: {}",
                self.node_id,
                message.name(),
                recipient,
                e
            );
        }
    }

    fn emit(&self, event: ExchangeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_status(&self) {
        self.status.send_replace(ExchangeStatus {
            node_id: self.node_id,
            topology_version: self.topology.version(),
            coordinator: self.topology.coordinator(),
            last_committed: self.last_committed_version().max(self.fence),
            in_flight: self.in_flight.as_ref().map(|r| r.version()),
            queued: self.collecting.len(),
            outstanding: self.outstanding.len() + self.awaiting.len(),
        });
    }
}

fn decision_for(outcome: Outcome) -> Decision {
    match outcome {
        Outcome::Accepted => Decision::Accepted,
        Outcome::Rejected(reason) => Decision::Rejected(reason),
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}
