//! Optional persisted exchange state

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ExchangeResult};
use crate::request::DeploymentId;
use crate::round::RoundVersion;

/// State persisted after every committed round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeCheckpoint {
    /// Last round this member committed
    pub last_finalized: RoundVersion,
    /// Resource name to the deployment id that created it
    pub applied: BTreeMap<String, DeploymentId>,
}

impl TryFrom<Bytes> for ExchangeCheckpoint {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Ok(ciborium::de::from_reader(bytes.as_ref())?)
    }
}

impl TryInto<Bytes> for ExchangeCheckpoint {
    type Error = Error;

    fn try_into(self) -> Result<Bytes, Self::Error> {
        let mut writer = Vec::new();
        ciborium::ser::into_writer(&self, &mut writer)?;
        Ok(Bytes::from(writer))
    }
}

/// Storage for the checkpoint of one member
#[async_trait]
pub trait CheckpointStore: Debug + Send + Sync + 'static {
    /// Load the last saved checkpoint
    async fn load(&self) -> ExchangeResult<Option<ExchangeCheckpoint>>;

    /// Replace the saved checkpoint
    async fn save(&self, checkpoint: &ExchangeCheckpoint) -> ExchangeResult<()>;
}

/// Checkpoint store kept in memory as encoded bytes.
///
/// Clones share the same slot, so a test can hand the same store to a
/// restarted member.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    slot: Arc<Mutex<Option<Bytes>>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> ExchangeResult<Option<ExchangeCheckpoint>> {
        let bytes = self.slot.lock().clone();
        bytes.map(ExchangeCheckpoint::try_from).transpose()
    }

    async fn save(&self, checkpoint: &ExchangeCheckpoint) -> ExchangeResult<()> {
        let bytes: Bytes = checkpoint.clone().try_into()?;
        *self.slot.lock() = Some(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_saves_and_loads() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load().await.unwrap().is_none());

        let checkpoint = ExchangeCheckpoint {
            last_finalized: RoundVersion::new(4, 2),
            applied: [("orders".to_string(), DeploymentId::from("d1"))].into(),
        };
        store.save(&checkpoint).await.unwrap();

        let shared = store.clone();
        assert_eq!(shared.load().await.unwrap(), Some(checkpoint));
    }
}
