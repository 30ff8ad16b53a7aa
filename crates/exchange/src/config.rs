//! Exchange configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ExchangeResult};

/// Configuration of one exchange member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// How long the coordinator waits for more requests before opening a
    /// round
    #[serde(with = "duration_ms")]
    pub batch_window: Duration,

    /// How long `submit` waits for the request to be enqueued
    #[serde(with = "duration_ms")]
    pub enqueue_timeout: Duration,

    /// How long `withdraw` waits for the coordinator's answer
    #[serde(with = "duration_ms")]
    pub withdraw_timeout: Duration,

    /// Maximum number of decided deployment ids remembered
    pub dedup_history_limit: usize,

    /// Capacity of the handle-to-service command channel
    pub command_buffer: usize,

    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            enqueue_timeout: Duration::from_secs(5),
            withdraw_timeout: Duration::from_secs(5),
            dedup_history_limit: 10_000,
            command_buffer: 1024,
            event_buffer: 1024,
        }
    }
}

impl ExchangeConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml(source: &str) -> ExchangeResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the batching window
    pub fn with_batch_window(mut self, batch_window: Duration) -> Self {
        self.batch_window = batch_window;
        self
    }

    /// Set the dedup history limit
    pub fn with_dedup_history_limit(mut self, limit: usize) -> Self {
        self.dedup_history_limit = limit;
        self
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> ExchangeResult<()> {
        if self.batch_window.is_zero() {
            return Err(Error::configuration("batch_window must be positive"));
        }
        if self.dedup_history_limit == 0 {
            return Err(Error::configuration("dedup_history_limit must be positive"));
        }
        if self.command_buffer == 0 || self.event_buffer == 0 {
            return Err(Error::configuration("channel buffers must be positive"));
        }
        Ok(())
    }
}

/// Durations as whole milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
