//! Per-member registry of started resources

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cachex_topology::NodeId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::decision::Outcome;
use crate::error::ApplyError;
use crate::hooks::ResourceHooks;
use crate::request::{CacheConfig, ChangeRequest, DeploymentId, NearCacheConfig};
use crate::round::{RoundEntry, validate_batch};

/// Lifecycle state of a local resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Storage is being created
    Starting,
    /// Storage exists and serves requests
    Started,
    /// Storage is being released
    Stopping,
    /// Storage is gone; the descriptor is about to be removed
    Stopped,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Starting => write!(f, "STARTING"),
            ResourceState::Started => write!(f, "STARTED"),
            ResourceState::Stopping => write!(f, "STOPPING"),
            ResourceState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A resource known to this member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Resource name
    pub name: String,
    /// Configuration it was started with
    pub config: CacheConfig,
    /// Request that created it
    pub deployment_id: DeploymentId,
    /// Lifecycle state
    pub state: ResourceState,
    /// Client projections by origin member
    pub projections: BTreeMap<NodeId, NearCacheConfig>,
}

/// A cluster-accepted resource whose local initialization failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanRecord {
    /// Configuration accepted by the cluster
    pub config: CacheConfig,
    /// Request that created it
    pub deployment_id: DeploymentId,
    /// Hook failure message
    pub reason: String,
    /// Client projections by origin member
    pub projections: BTreeMap<NodeId, NearCacheConfig>,
}

/// Cluster-level view of one resource, as handed to joining members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Configuration
    pub config: CacheConfig,
    /// Request that created it
    pub deployment_id: DeploymentId,
    /// Client projections by origin member
    pub projections: BTreeMap<NodeId, NearCacheConfig>,
}

/// All resources known to a member, orphans included
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Entries by resource name
    pub resources: BTreeMap<String, SnapshotEntry>,
}

/// Per-member map of resource name to descriptor.
///
/// Reads never block. Mutations go through the apply path and are
/// serialized per name.
#[derive(Debug)]
pub struct LocalResourceRegistry {
    node_id: NodeId,
    hooks: Arc<dyn ResourceHooks>,
    resources: DashMap<String, ResourceDescriptor>,
    orphans: DashMap<String, OrphanRecord>,
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalResourceRegistry {
    /// Create an empty registry for a member
    pub fn new(node_id: NodeId, hooks: Arc<dyn ResourceHooks>) -> Self {
        Self {
            node_id,
            hooks,
            resources: DashMap::new(),
            orphans: DashMap::new(),
            gates: DashMap::new(),
        }
    }

    /// Descriptor of a resource
    pub fn lookup(&self, name: &str) -> Option<ResourceDescriptor> {
        self.resources.get(name).map(|entry| entry.value().clone())
    }

    /// All descriptors, sorted by name
    pub fn list(&self) -> Vec<ResourceDescriptor> {
        let mut all: Vec<ResourceDescriptor> = self
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Orphan record of a resource
    pub fn orphan(&self, name: &str) -> Option<OrphanRecord> {
        self.orphans.get(name).map(|entry| entry.value().clone())
    }

    /// Whether the cluster considers `name` live, as far as this member knows
    pub fn contains(&self, name: &str) -> bool {
        self.orphans.contains_key(name)
            || self
                .resources
                .get(name)
                .is_some_and(|entry| entry.state != ResourceState::Stopped)
    }

    /// Deployment id of the request that created `name`
    pub fn created_by(&self, name: &str) -> Option<DeploymentId> {
        self.resources
            .get(name)
            .map(|entry| entry.deployment_id.clone())
            .or_else(|| self.orphans.get(name).map(|o| o.deployment_id.clone()))
    }

    /// Resource name to creating deployment id, orphans included
    pub fn applied(&self) -> BTreeMap<String, DeploymentId> {
        self.snapshot()
            .resources
            .into_iter()
            .map(|(name, entry)| (name, entry.deployment_id))
            .collect()
    }

    /// Read-only vote on a batch, in batch order.
    ///
    /// Earlier accepted entries of the batch count as applied for the
    /// entries after them.
    pub fn validate(&self, entries: &[RoundEntry]) -> Vec<Outcome> {
        validate_batch(entries, |name| self.contains(name))
    }

    /// Apply an accepted request
    pub async fn apply(&self, request: &ChangeRequest) -> Result<(), ApplyError> {
        let name = request.resource_name();
        let gate = self.gate(name);

        let result = {
            let _guard = gate.lock().await;
            match request {
                ChangeRequest::Start {
                    deployment_id,
                    config,
                } => self.apply_start(deployment_id, config).await,
                ChangeRequest::Stop { name, .. } => self.apply_stop(name).await,
                ChangeRequest::ClientAttach {
                    origin_node,
                    config,
                    near,
                    ..
                } => self.apply_attach(&config.name, origin_node, near).await,
            }
        };

        self.release_gate(name, gate);
        result
    }

    async fn apply_start(
        &self,
        deployment_id: &DeploymentId,
        config: &CacheConfig,
    ) -> Result<(), ApplyError> {
        let name = config.name.as_str();
        if self.contains(name) {
            return Err(ApplyError::NameConflict(name.to_string()));
        }

        self.resources.insert(
            name.to_string(),
            ResourceDescriptor {
                name: name.to_string(),
                config: config.clone(),
                deployment_id: deployment_id.clone(),
                state: ResourceState::Starting,
                projections: BTreeMap::new(),
            },
        );

        match self.hooks.on_create(name, config).await {
            Ok(()) => {
                if let Some(mut entry) = self.resources.get_mut(name) {
                    entry.state = ResourceState::Started;
                }
                info!("Node {} started resource '{}'", self.node_id, name);
                Ok(())
            }
            Err(e) => {
                self.resources.remove(name);
                self.orphans.insert(
                    name.to_string(),
                    OrphanRecord {
                        config: config.clone(),
                        deployment_id: deployment_id.clone(),
                        reason: e.to_string(),
                        projections: BTreeMap::new(),
                    },
                );
                warn!(
                    "Node {} failed to initialize resource '{}': {}",
                    self.node_id, name, e
                );
                Err(ApplyError::InitializationFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn apply_stop(&self, name: &str) -> Result<(), ApplyError> {
        if self.orphans.remove(name).is_some() {
            debug!("Node {} dropped orphan record '{}'", self.node_id, name);
            return Ok(());
        }

        match self.resources.get_mut(name) {
            Some(mut entry) => entry.state = ResourceState::Stopping,
            None => return Err(ApplyError::NotFound(name.to_string())),
        }

        let result = self.hooks.on_destroy(name).await;

        if let Some(mut entry) = self.resources.get_mut(name) {
            entry.state = ResourceState::Stopped;
        }
        self.resources.remove(name);

        match result {
            Ok(()) => {
                info!("Node {} stopped resource '{}'", self.node_id, name);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Node {} failed to destroy resource '{}': {}",
                    self.node_id, name, e
                );
                Err(ApplyError::DestroyFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn apply_attach(
        &self,
        name: &str,
        origin_node: &NodeId,
        near: &NearCacheConfig,
    ) -> Result<(), ApplyError> {
        if let Some(mut orphan) = self.orphans.get_mut(name) {
            orphan.projections.insert(*origin_node, near.clone());
            if origin_node == &self.node_id {
                return Err(ApplyError::AttachFailed {
                    name: name.to_string(),
                    reason: format!("resource failed to initialize locally: {}", orphan.reason),
                });
            }
            return Ok(());
        }

        match self.resources.get_mut(name) {
            Some(mut entry) if entry.state == ResourceState::Started => {
                entry.projections.insert(*origin_node, near.clone());
            }
            _ => return Err(ApplyError::NotFound(name.to_string())),
        }

        if origin_node != &self.node_id {
            return Ok(());
        }

        self.hooks
            .on_attach(name, near)
            .await
            .map_err(|e| ApplyError::AttachFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        info!("Node {} attached client to '{}'", self.node_id, name);
        Ok(())
    }

    /// Cluster-level view of every resource known here
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut resources: BTreeMap<String, SnapshotEntry> = self
            .resources
            .iter()
            .filter(|entry| entry.state != ResourceState::Stopped)
            .map(|entry| {
                (
                    entry.key().clone(),
                    SnapshotEntry {
                        config: entry.config.clone(),
                        deployment_id: entry.deployment_id.clone(),
                        projections: entry.projections.clone(),
                    },
                )
            })
            .collect();

        for orphan in self.orphans.iter() {
            resources.insert(
                orphan.key().clone(),
                SnapshotEntry {
                    config: orphan.config.clone(),
                    deployment_id: orphan.deployment_id.clone(),
                    projections: orphan.projections.clone(),
                },
            );
        }

        RegistrySnapshot { resources }
    }

    /// Reconcile local state to a snapshot taken on another member.
    ///
    /// Returns the local failures hit while creating or destroying storage.
    pub async fn install(&self, snapshot: &RegistrySnapshot) -> Vec<ApplyError> {
        let mut failures = Vec::new();

        let mut local: Vec<String> = self
            .resources
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.orphans.iter().map(|entry| entry.key().clone()))
            .collect();
        local.sort();
        local.dedup();

        for name in local {
            let keep = snapshot
                .resources
                .get(&name)
                .is_some_and(|entry| self.created_by(&name).as_ref() == Some(&entry.deployment_id));
            if keep {
                continue;
            }

            let gate = self.gate(&name);
            {
                let _guard = gate.lock().await;
                if let Err(e) = self.apply_stop(&name).await {
                    failures.push(e);
                }
            }
            self.release_gate(&name, gate);
        }

        for (name, entry) in &snapshot.resources {
            let gate = self.gate(name);
            {
                let _guard = gate.lock().await;

                if !self.contains(name) {
                    if let Err(e) = self.apply_start(&entry.deployment_id, &entry.config).await
                    {
                        failures.push(e);
                    }
                }

                for (origin, near) in &entry.projections {
                    if self.has_projection(name, origin) {
                        continue;
                    }
                    if let Err(e) = self.apply_attach(name, origin, near).await {
                        failures.push(e);
                    }
                }
            }
            self.release_gate(name, gate);
        }

        info!(
            "Node {} installed registry snapshot with {} resources ({} local failures)",
            self.node_id,
            snapshot.resources.len(),
            failures.len()
        );

        failures
    }

    fn has_projection(&self, name: &str, origin: &NodeId) -> bool {
        self.resources
            .get(name)
            .map(|entry| entry.projections.contains_key(origin))
            .or_else(|| {
                self.orphans
                    .get(name)
                    .map(|orphan| orphan.projections.contains_key(origin))
            })
            .unwrap_or(false)
    }

    fn gate(&self, name: &str) -> Arc<Mutex<()>> {
        self.gates
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the gate of `name` unless another apply holds or waits on it
    fn release_gate(&self, name: &str, gate: Arc<Mutex<()>>) {
        drop(gate);
        self.gates
            .remove_if(name, |_, gate| Arc::strong_count(gate) == 1);
    }
}
