//! Exchange builder pattern

use std::sync::Arc;

use cachex_topology::{NodeId, TopologySource};
use cachex_transport::Transport;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::config::ExchangeConfig;
use crate::error::{Error, ErrorKind, ExchangeResult};
use crate::handle::{ExchangeHandle, ExchangeStatus};
use crate::hooks::{NoopHooks, ResourceHooks};
use crate::registry::LocalResourceRegistry;
use crate::service::{ExchangeService, ServiceChannels};

/// Exchange builder
pub struct ExchangeBuilder<T>
where
    T: Transport,
{
    /// Node ID
    node_id: NodeId,

    /// Configuration
    config: ExchangeConfig,

    /// Transport to the other members
    transport: Option<Arc<T>>,

    /// Source of topology snapshots
    topology: Option<Arc<dyn TopologySource>>,

    /// Storage engine callbacks
    hooks: Arc<dyn ResourceHooks>,

    /// Checkpoint storage
    checkpoint: Option<Arc<dyn CheckpointStore>>,
}

impl<T> ExchangeBuilder<T>
where
    T: Transport,
{
    /// Create a new exchange builder
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            config: ExchangeConfig::default(),
            transport: None,
            topology: None,
            hooks: Arc::new(NoopHooks),
            checkpoint: None,
        }
    }

    /// Set configuration
    pub fn with_config(mut self, config: ExchangeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set transport
    pub fn with_transport(mut self, transport: Arc<T>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set topology source
    pub fn with_topology(mut self, topology: Arc<dyn TopologySource>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Set storage engine hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn ResourceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set checkpoint store
    pub fn with_checkpoint(mut self, checkpoint: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Build the exchange and start its service task
    pub async fn build(self) -> ExchangeResult<ExchangeNode<T>> {
        self.config.validate()?;

        if self.node_id.as_uuid().is_nil() {
            return Err(Error::validation("node id must not be nil"));
        }

        let transport = self
            .transport
            .ok_or_else(|| Error::with_context(ErrorKind::Configuration, "Transport not set"))?;

        let topology = self.topology.ok_or_else(|| {
            Error::with_context(ErrorKind::Configuration, "Topology source not set")
        })?;

        let restored = match &self.checkpoint {
            Some(store) => store
                .load()
                .await
                .map_err(|e| Error::storage(format!("loading checkpoint failed: {e}")))?,
            None => None,
        };

        let registry = Arc::new(LocalResourceRegistry::new(self.node_id, self.hooks));
        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer);
        let (event_tx, _) = broadcast::channel(self.config.event_buffer);
        let (status_tx, status_rx) = watch::channel(ExchangeStatus {
            node_id: self.node_id,
            ..ExchangeStatus::default()
        });

        // Subscribe before reading the snapshot so no version is missed.
        let subscription = topology.subscribe();
        let snapshot = topology.snapshot();

        let channels = ServiceChannels {
            incoming: transport.incoming(),
            commands: command_rx,
            topology: subscription,
        };

        let service = ExchangeService::new(
            self.node_id,
            self.config.clone(),
            transport.clone(),
            registry.clone(),
            self.checkpoint,
            restored,
            snapshot,
            event_tx.clone(),
            status_tx,
        );

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(service.run(channels, shutdown.clone()));
        tracker.close();

        info!("Exchange node {} started", self.node_id);

        let handle = ExchangeHandle::new(
            self.node_id,
            Arc::new(self.config),
            command_tx,
            registry,
            event_tx,
            status_rx,
        );

        Ok(ExchangeNode {
            node_id: self.node_id,
            handle,
            transport,
            shutdown,
            tracker,
        })
    }
}

/// A running exchange member
pub struct ExchangeNode<T>
where
    T: Transport,
{
    node_id: NodeId,
    handle: ExchangeHandle,
    transport: Arc<T>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<T> ExchangeNode<T>
where
    T: Transport,
{
    /// Member id
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Submission handle
    pub fn handle(&self) -> ExchangeHandle {
        self.handle.clone()
    }

    /// Transport the member sends through
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Stop the service task and the transport
    pub async fn shutdown(&self) -> ExchangeResult<()> {
        info!("Shutting down exchange node {}", self.node_id);
        self.shutdown.cancel();
        self.tracker.wait().await;
        self.transport.shutdown().await?;
        Ok(())
    }
}

impl<T> Drop for ExchangeNode<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ExchangeCheckpoint;
    use async_trait::async_trait;
    use cachex_topology_mock::MockTopology;
    use cachex_transport_memory::{MemoryHub, MemoryTransport};
    use uuid::Uuid;

    #[derive(Debug)]
    struct UnreadableStore;

    #[async_trait]
    impl CheckpointStore for UnreadableStore {
        async fn load(&self) -> ExchangeResult<Option<ExchangeCheckpoint>> {
            Err(Error::protocol("truncated checkpoint"))
        }

        async fn save(&self, _checkpoint: &ExchangeCheckpoint) -> ExchangeResult<()> {
            Ok(())
        }
    }

    fn builder(hub: &MemoryHub, node_id: NodeId) -> ExchangeBuilder<MemoryTransport> {
        let topology: Arc<dyn TopologySource> = Arc::new(MockTopology::with_nodes(&[node_id]));
        ExchangeBuilder::new(node_id)
            .with_transport(Arc::new(hub.transport(node_id)))
            .with_topology(topology)
    }

    #[tokio::test]
    async fn test_nil_node_id_is_rejected() {
        let hub = MemoryHub::new();
        let result = builder(&hub, NodeId::from(Uuid::nil())).build().await;

        let err = result.err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unreadable_checkpoint_is_storage_error() {
        let hub = MemoryHub::new();
        let result = builder(&hub, NodeId::from_seed(1))
            .with_checkpoint(Arc::new(UnreadableStore))
            .build()
            .await;

        let err = result.err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::Storage);
        assert!(err.to_string().contains("truncated checkpoint"));
    }

    #[tokio::test]
    async fn test_missing_transport_is_configuration_error() {
        let topology: Arc<dyn TopologySource> =
            Arc::new(MockTopology::with_nodes(&[NodeId::from_seed(1)]));
        let result = ExchangeBuilder::<MemoryTransport>::new(NodeId::from_seed(1))
            .with_topology(topology)
            .build()
            .await;

        let err = result.err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::Configuration);
    }
}
