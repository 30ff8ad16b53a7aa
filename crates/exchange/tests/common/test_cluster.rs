//! Test cluster utilities for integration testing

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cachex_exchange::messages::{ExchangeMessage, MESSAGE_TYPE};
use cachex_exchange::{
    ExchangeBuilder, ExchangeConfig, ExchangeHandle, ExchangeNode, MemoryCheckpointStore,
    MemoryHooks,
};
use cachex_topology::{NodeId, TopologySource};
use cachex_topology_mock::MockTopology;
use cachex_transport::{Transport, TransportEnvelope};
use cachex_transport_memory::{MemoryHub, MemoryTransport};
use futures::{Stream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize logging once per test binary
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("cachex_exchange=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Config with a short batch window so tests run quickly
pub fn test_config() -> ExchangeConfig {
    ExchangeConfig::default().with_batch_window(Duration::from_millis(50))
}

/// One running member of a test cluster
pub struct TestNode {
    /// Member id
    pub node_id: NodeId,
    /// Running exchange member
    pub node: ExchangeNode<MemoryTransport>,
    /// Storage engine stand-in of the member
    pub hooks: MemoryHooks,
    /// Checkpoint store, kept across restarts
    pub checkpoint: MemoryCheckpointStore,
}

impl TestNode {
    /// Submission handle of the member
    pub fn handle(&self) -> ExchangeHandle {
        self.node.handle()
    }
}

/// Test cluster manager
pub struct TestCluster {
    /// In-process network shared by all members
    pub hub: MemoryHub,
    /// Scriptable membership
    pub topology: Arc<MockTopology>,
    /// Members in join order
    pub nodes: Vec<TestNode>,
    config: ExchangeConfig,
}

impl TestCluster {
    /// Start `count` members that join in one topology version.
    ///
    /// Node ids are seeded with 1..=count so join order is stable.
    pub async fn start(count: u8) -> Self {
        Self::start_with_config(count, test_config()).await
    }

    /// Start `count` members with a custom config
    pub async fn start_with_config(count: u8, config: ExchangeConfig) -> Self {
        let ids: Vec<NodeId> = (1..=count).map(NodeId::from_seed).collect();
        let topology = Arc::new(MockTopology::with_nodes(&ids));
        Self::start_members(MemoryHub::new(), topology, ids, config).await
    }

    /// Start `count` members behind a hand-driven coordinator.
    ///
    /// The puppet joins first with seed 1, so it coordinates until it is
    /// removed from the topology; members get seeds 2..=count + 1.
    pub async fn start_with_puppet(count: u8) -> (Self, Puppet) {
        let hub = MemoryHub::new();
        let puppet_id = NodeId::from_seed(1);
        let ids: Vec<NodeId> = (2..=count + 1).map(NodeId::from_seed).collect();

        let mut all = vec![puppet_id];
        all.extend(ids.iter().copied());
        let topology = Arc::new(MockTopology::with_nodes(&all));

        let transport = hub.transport(puppet_id);
        let puppet = Puppet {
            node_id: puppet_id,
            incoming: transport.incoming(),
            transport,
        };

        let cluster = Self::start_members(hub, topology, ids, test_config()).await;
        (cluster, puppet)
    }

    /// Raw message endpoint on the network that never joins the topology
    pub fn outsider(&self, seed: u8) -> Puppet {
        let node_id = NodeId::from_seed(seed);
        let transport = self.hub.transport(node_id);
        Puppet {
            node_id,
            incoming: transport.incoming(),
            transport,
        }
    }

    async fn start_members(
        hub: MemoryHub,
        topology: Arc<MockTopology>,
        ids: Vec<NodeId>,
        config: ExchangeConfig,
    ) -> Self {
        let count = ids.len();
        let mut cluster = Self {
            hub,
            topology,
            nodes: Vec::new(),
            config,
        };

        // Routes must exist before any member starts sending.
        let transports: Vec<MemoryTransport> =
            ids.iter().map(|id| cluster.hub.transport(*id)).collect();

        for (node_id, transport) in ids.into_iter().zip(transports) {
            let node = cluster
                .build_node(
                    node_id,
                    transport,
                    MemoryHooks::new(),
                    MemoryCheckpointStore::new(),
                )
                .await;
            cluster.nodes.push(node);
        }

        info!("Started test cluster with {} nodes", count);
        cluster
    }

    async fn build_node(
        &self,
        node_id: NodeId,
        transport: MemoryTransport,
        hooks: MemoryHooks,
        checkpoint: MemoryCheckpointStore,
    ) -> TestNode {
        let topology: Arc<dyn TopologySource> = self.topology.clone();
        let node = ExchangeBuilder::new(node_id)
            .with_config(self.config.clone())
            .with_transport(Arc::new(transport))
            .with_topology(topology)
            .with_hooks(Arc::new(hooks.clone()))
            .with_checkpoint(Arc::new(checkpoint.clone()))
            .build()
            .await
            .expect("Failed to build exchange node");

        TestNode {
            node_id,
            node,
            hooks,
            checkpoint,
        }
    }

    /// Member at `index`
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Handle of the member at `index`
    pub fn handle(&self, index: usize) -> ExchangeHandle {
        self.nodes[index].handle()
    }

    /// Add a fresh member as the youngest one
    pub async fn add_node(&mut self, seed: u8) -> usize {
        let node_id = NodeId::from_seed(seed);
        let transport = self.hub.transport(node_id);
        let node = self
            .build_node(
                node_id,
                transport,
                MemoryHooks::new(),
                MemoryCheckpointStore::new(),
            )
            .await;
        self.nodes.push(node);
        self.topology
            .add_node(node_id)
            .expect("Failed to add node to topology");
        self.nodes.len() - 1
    }

    /// Stop the member at `index` and remove it from the topology
    pub async fn kill_node(&mut self, index: usize) -> TestNode {
        let node = self.nodes.remove(index);
        if let Err(e) = node.node.shutdown().await {
            warn!("Failed to shut down node {}: {}", node.node_id, e);
        }
        self.topology
            .remove_node(node.node_id)
            .expect("Failed to remove node from topology");
        node
    }

    /// Restart the member at `index` with empty storage and its checkpoint
    pub async fn restart_node(&mut self, index: usize) {
        let old = self.nodes.remove(index);
        if let Err(e) = old.node.shutdown().await {
            warn!("Failed to shut down node {}: {}", old.node_id, e);
        }

        let transport = self.hub.transport(old.node_id);
        let node = self
            .build_node(old.node_id, transport, MemoryHooks::new(), old.checkpoint)
            .await;
        self.nodes.push(node);
        self.topology
            .restart_node(old.node_id)
            .expect("Failed to restart node in topology");
    }

    /// Wait until every member processed the current topology version
    pub async fn wait_for_topology(&self, timeout: Duration) -> Result<(), String> {
        let version = self.topology.snapshot().version();
        self.wait_until(timeout, |node| {
            node.handle().status().topology_version >= version
        })
        .await
    }

    /// Wait until every member has `name` in its registry
    pub async fn wait_for_resource(&self, name: &str, timeout: Duration) -> Result<(), String> {
        self.wait_until(timeout, |node| node.handle().lookup(name).is_some())
            .await
    }

    /// Wait until no member has `name` in its registry
    pub async fn wait_for_no_resource(&self, name: &str, timeout: Duration) -> Result<(), String> {
        self.wait_until(timeout, |node| node.handle().lookup(name).is_none())
            .await
    }

    /// Poll every member until `check` holds for all of them
    pub async fn wait_until<F>(&self, timeout: Duration, check: F) -> Result<(), String>
    where
        F: Fn(&TestNode) -> bool,
    {
        let start = Instant::now();
        loop {
            if self.nodes.iter().all(&check) {
                return Ok(());
            }
            if start.elapsed() > timeout {
                let pending: Vec<String> = self
                    .nodes
                    .iter()
                    .filter(|node| !check(node))
                    .map(|node| node.node_id.to_string())
                    .collect();
                return Err(format!(
                    "Condition not met within {timeout:?} on nodes {pending:?}"
                ));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop every member
    pub async fn shutdown(self) {
        for node in &self.nodes {
            if let Err(e) = node.node.shutdown().await {
                warn!("Failed to shut down node {}: {}", node.node_id, e);
            }
        }
    }
}

/// A member driven by hand through raw exchange messages
pub struct Puppet {
    /// Member id of the puppet
    pub node_id: NodeId,
    transport: MemoryTransport,
    incoming: Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>>,
}

impl Puppet {
    /// Send a message as the puppet
    pub async fn send(&self, recipient: NodeId, message: &ExchangeMessage) {
        let payload = message.encode().expect("Failed to encode message");
        self.transport
            .send_envelope(&recipient, &payload, MESSAGE_TYPE)
            .await
            .expect("Failed to send message");
    }

    /// Next message sent to the puppet
    pub async fn recv(&mut self) -> (NodeId, ExchangeMessage) {
        let envelope = tokio::time::timeout(Duration::from_secs(10), self.incoming.next())
            .await
            .expect("Timed out waiting for a message")
            .expect("Puppet transport closed");
        let message =
            ExchangeMessage::try_from(envelope.payload).expect("Failed to decode message");
        (envelope.sender, message)
    }
}
