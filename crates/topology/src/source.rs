//! Topology source boundary and change subscriptions

use std::fmt::Debug;

use tokio::sync::watch;
use tracing::debug;

use crate::{TopologyError, TopologySnapshot};

/// Supplies ordered topology versions and the current member set.
///
/// Implementations must never publish a version lower than or equal to one
/// already published.
pub trait TopologySource: Debug + Send + Sync + 'static {
    /// Latest published snapshot
    fn snapshot(&self) -> TopologySnapshot;

    /// Subscribe to snapshot updates
    fn subscribe(&self) -> TopologySubscription;
}

/// Publishes snapshots to any number of subscriptions
#[derive(Debug)]
pub struct TopologyBroadcaster {
    sender: watch::Sender<TopologySnapshot>,
}

impl TopologyBroadcaster {
    /// Create a broadcaster seeded with an initial snapshot
    pub fn new(initial: TopologySnapshot) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Publish a new snapshot.
    ///
    /// Snapshots that do not advance the version are refused.
    pub fn publish(&self, snapshot: TopologySnapshot) -> Result<(), TopologyError> {
        let current = self.sender.borrow().version();
        if snapshot.version() <= current {
            return Err(TopologyError::StaleVersion {
                current,
                received: snapshot.version(),
            });
        }

        debug!(
            "Publishing topology version {} with {} members",
            snapshot.version(),
            snapshot.len()
        );
        self.sender.send_replace(snapshot);
        Ok(())
    }

    /// Latest published snapshot
    pub fn current(&self) -> TopologySnapshot {
        self.sender.borrow().clone()
    }

    /// Create a new subscription
    pub fn subscribe(&self) -> TopologySubscription {
        TopologySubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receives topology snapshots as they are published
#[derive(Debug, Clone)]
pub struct TopologySubscription {
    receiver: watch::Receiver<TopologySnapshot>,
}

impl TopologySubscription {
    /// Wait until a snapshot newer than the last one seen is published
    pub async fn changed(&mut self) -> Result<(), TopologyError> {
        self.receiver
            .changed()
            .await
            .map_err(|_| TopologyError::Closed)
    }

    /// Latest snapshot, marking it as seen
    pub fn latest(&mut self) -> TopologySnapshot {
        self.receiver.borrow_and_update().clone()
    }
}
