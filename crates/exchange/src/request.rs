//! Change requests: the immutable intents carried through exchange rounds

use std::collections::BTreeMap;
use std::fmt;

use cachex_topology::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision::RejectReason;

/// Globally unique identifier of a change request.
///
/// Used as the idempotency key across retries and restarts. Ordering is
/// lexicographic on the string form, which the same-name tie-break relies on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// String form of the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeploymentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeploymentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How entries of a cache are distributed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Entries are split across members with backups
    #[default]
    Partitioned,
    /// Every member holds every entry
    Replicated,
    /// Entries never leave the member that stored them
    Local,
}

/// Write atomicity of a cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicityMode {
    /// Single-entry atomic writes
    #[default]
    Atomic,
    /// Multi-entry transactions
    Transactional,
}

/// Full configuration of a cache, as carried by start requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache name, unique cluster-wide
    pub name: String,
    /// Distribution mode
    pub mode: CacheMode,
    /// Number of backup copies for partitioned caches
    pub backups: u32,
    /// Write atomicity
    pub atomicity: AtomicityMode,
    /// Entry limit, unbounded when absent
    pub max_entries: Option<u64>,
    /// Opaque options passed through to the storage engine
    pub properties: BTreeMap<String, String>,
}

impl CacheConfig {
    /// Partitioned, atomic cache with no backups
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: CacheMode::default(),
            backups: 0,
            atomicity: AtomicityMode::default(),
            max_entries: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set the distribution mode
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the backup count
    pub fn with_backups(mut self, backups: u32) -> Self {
        self.backups = backups;
        self
    }

    /// Set the atomicity mode
    pub fn with_atomicity(mut self, atomicity: AtomicityMode) -> Self {
        self.atomicity = atomicity;
        self
    }

    /// Set the entry limit
    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Add an engine property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Eviction policy of a client-side projection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least recently used
    #[default]
    Lru,
    /// First in, first out
    Fifo,
    /// Never evict
    None,
}

/// Projection-only configuration of a client attach ("near cache")
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearCacheConfig {
    /// Entry limit of the projection
    pub max_entries: Option<u64>,
    /// Eviction policy once the limit is reached
    pub eviction: EvictionPolicy,
}

/// Kind of a change request, for logs and events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Cache start
    Start,
    /// Cache stop
    Stop,
    /// Client attach
    ClientAttach,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Start => write!(f, "start"),
            RequestKind::Stop => write!(f, "stop"),
            RequestKind::ClientAttach => write!(f, "client-attach"),
        }
    }
}

/// A lifecycle intent for one named cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeRequest {
    /// Create a cache cluster-wide
    Start {
        /// Idempotency key
        deployment_id: DeploymentId,
        /// Configuration of the new cache
        config: CacheConfig,
    },
    /// Destroy a cache cluster-wide
    Stop {
        /// Idempotency key
        deployment_id: DeploymentId,
        /// Name of the cache to destroy
        name: String,
    },
    /// Attach a client-side projection of an existing cache
    ClientAttach {
        /// Idempotency key
        deployment_id: DeploymentId,
        /// Member that hosts the projection
        origin_node: NodeId,
        /// Configuration of the backing cache
        config: CacheConfig,
        /// Projection configuration
        near: NearCacheConfig,
    },
}

impl ChangeRequest {
    /// Request to start a cache
    pub fn start(config: CacheConfig) -> Self {
        ChangeRequest::Start {
            deployment_id: DeploymentId::generate(),
            config,
        }
    }

    /// Request to stop a cache
    pub fn stop(name: impl Into<String>) -> Self {
        ChangeRequest::Stop {
            deployment_id: DeploymentId::generate(),
            name: name.into(),
        }
    }

    /// Request to attach a projection of `config.name` on `origin_node`
    pub fn client_attach(origin_node: NodeId, config: CacheConfig, near: NearCacheConfig) -> Self {
        ChangeRequest::ClientAttach {
            deployment_id: DeploymentId::generate(),
            origin_node,
            config,
            near,
        }
    }

    /// Replace the generated id, e.g. to replay an earlier request
    pub fn with_deployment_id(self, id: impl Into<DeploymentId>) -> Self {
        let deployment_id = id.into();
        match self {
            ChangeRequest::Start { config, .. } => ChangeRequest::Start {
                deployment_id,
                config,
            },
            ChangeRequest::Stop { name, .. } => ChangeRequest::Stop {
                deployment_id,
                name,
            },
            ChangeRequest::ClientAttach {
                origin_node,
                config,
                near,
                ..
            } => ChangeRequest::ClientAttach {
                deployment_id,
                origin_node,
                config,
                near,
            },
        }
    }

    /// Idempotency key of this request
    pub fn deployment_id(&self) -> &DeploymentId {
        match self {
            ChangeRequest::Start { deployment_id, .. }
            | ChangeRequest::Stop { deployment_id, .. }
            | ChangeRequest::ClientAttach { deployment_id, .. } => deployment_id,
        }
    }

    /// Name of the targeted cache
    pub fn resource_name(&self) -> &str {
        match self {
            ChangeRequest::Stop { name, .. } => name,
            ChangeRequest::Start { config, .. } | ChangeRequest::ClientAttach { config, .. } => {
                &config.name
            }
        }
    }

    /// Request kind
    pub fn kind(&self) -> RequestKind {
        match self {
            ChangeRequest::Start { .. } => RequestKind::Start,
            ChangeRequest::Stop { .. } => RequestKind::Stop,
            ChangeRequest::ClientAttach { .. } => RequestKind::ClientAttach,
        }
    }

    /// Whether this is a plain cache start
    pub fn is_start(&self) -> bool {
        matches!(self, ChangeRequest::Start { .. })
    }

    /// Whether this is a cache stop
    pub fn is_stop(&self) -> bool {
        matches!(self, ChangeRequest::Stop { .. })
    }

    /// Whether this is a client attach
    pub fn is_client_attach(&self) -> bool {
        matches!(self, ChangeRequest::ClientAttach { .. })
    }

    /// Cache configuration, present for start and attach requests
    pub fn start_config(&self) -> Option<&CacheConfig> {
        match self {
            ChangeRequest::Start { config, .. } | ChangeRequest::ClientAttach { config, .. } => {
                Some(config)
            }
            ChangeRequest::Stop { .. } => None,
        }
    }

    /// Requesting member, present for client attach requests
    pub fn origin_node(&self) -> Option<&NodeId> {
        match self {
            ChangeRequest::ClientAttach { origin_node, .. } => Some(origin_node),
            _ => None,
        }
    }

    /// Projection configuration, present for client attach requests
    pub fn near_config(&self) -> Option<&NearCacheConfig> {
        match self {
            ChangeRequest::ClientAttach { near, .. } => Some(near),
            _ => None,
        }
    }

    /// Check the request before it may enter a round
    pub fn validate(&self) -> Result<(), RejectReason> {
        if self.deployment_id().as_str().is_empty() {
            return Err(RejectReason::MalformedRequest(
                "deployment id is empty".to_string(),
            ));
        }

        if self.resource_name().trim().is_empty() {
            return Err(RejectReason::MalformedRequest(format!(
                "{} request has an empty cache name",
                self.kind()
            )));
        }

        if self.origin_node().is_some_and(|origin| origin.as_uuid().is_nil()) {
            return Err(RejectReason::MalformedRequest(
                "client attach has no origin node".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for ChangeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' ({})",
            self.kind(),
            self.resource_name(),
            self.deployment_id()
        )
    }
}
