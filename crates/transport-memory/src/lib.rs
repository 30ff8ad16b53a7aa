//! In-memory transport implementation for testing
//!
//! This transport routes envelopes between members within the same process,
//! perfect for testing and single-process clusters.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use cachex_topology::NodeId;
use cachex_transport::{Config, Transport, TransportEnvelope, TransportError};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tracing::{debug, info};

type Routes = Arc<DashMap<NodeId, flume::Sender<TransportEnvelope>>>;

/// Shared routing table for a set of in-process members
///
/// Each hub is an isolated network; tests create one hub per cluster.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    routes: Routes,
    config: Config,
}

impl MemoryHub {
    /// Create a new hub with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new hub with custom options
    pub fn with_config(config: Config) -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Register a member and return its transport.
    ///
    /// Registering an id again replaces the previous route, as a restarted
    /// member would.
    pub fn transport(&self, node_id: NodeId) -> MemoryTransport {
        let (sender, receiver) = flume::unbounded();
        if self.routes.insert(node_id, sender.clone()).is_some() {
            info!("Replaced memory route for node {}", node_id);
        } else {
            info!("Registered memory route for node {}", node_id);
        }

        MemoryTransport {
            node_id,
            routes: self.routes.clone(),
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            shutdown: Arc::new(AtomicBool::new(false)),
            max_message_size: self.config.max_message_size,
        }
    }

    /// Drop the route to a member, making it unreachable
    pub fn disconnect(&self, node_id: &NodeId) {
        if self.routes.remove(node_id).is_some() {
            info!("Disconnected memory route for node {}", node_id);
        }
    }

    /// Whether a member currently has a route
    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.routes.contains_key(node_id)
    }
}

/// Memory transport bound to one member
#[derive(Clone)]
pub struct MemoryTransport {
    node_id: NodeId,
    routes: Routes,
    sender: flume::Sender<TransportEnvelope>,
    receiver: Arc<Mutex<Option<flume::Receiver<TransportEnvelope>>>>,
    shutdown: Arc<AtomicBool>,
    max_message_size: usize,
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("node_id", &self.node_id)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryTransport {
    /// Member this transport belongs to
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_envelope(
        &self,
        recipient: &NodeId,
        payload: &Bytes,
        message_type: &str,
    ) -> Result<(), TransportError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }

        if payload.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }

        let route = self
            .routes
            .get(recipient)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::Unreachable(*recipient))?;

        debug!(
            "Memory transport {} sending {} ({} bytes) to {}",
            self.node_id,
            message_type,
            payload.len(),
            recipient
        );

        route
            .send(TransportEnvelope {
                message_type: message_type.to_string(),
                payload: payload.clone(),
                sender: self.node_id,
            })
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>> {
        match self.receiver.lock().take() {
            Some(receiver) => Box::pin(receiver.into_stream()),
            None => Box::pin(futures::stream::empty()),
        }
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        debug!("Shutting down memory transport for node {}", self.node_id);
        self.shutdown.store(true, Ordering::Release);

        // A restart may already have replaced our route.
        self.routes
            .remove_if(&self.node_id, |_, route| route.same_channel(&self.sender));

        Ok(())
    }
}
