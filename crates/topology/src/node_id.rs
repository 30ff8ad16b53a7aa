//! Node identifier

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a cluster member
///
/// Identifiers are stable across restarts of the same member; a restart is
/// observed through a new join order on [`crate::Member`] instead.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a random node id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic node id for tests and fixtures
    pub fn from_seed(seed: u8) -> Self {
        Self(Uuid::from_bytes([seed; 16]))
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Short form used in log lines
    pub fn to_hex_short(&self) -> String {
        let simple = self.0.simple().to_string();
        simple[..8].to_string()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_short())
    }
}
