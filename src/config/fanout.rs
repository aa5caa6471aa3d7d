use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_MAX_QUEUE_SIZE;
use crate::constants::DEFAULT_QUEUE_SIZE;
use crate::Error;
use crate::Result;

/// Configuration for a [`Fanout`](crate::Fanout) instance
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Capacity of a watcher queue when its `WatchSpec` leaves `queue_size` at 0
    ///
    /// A watcher whose queue fills up is evicted, so this is the number of
    /// events a consumer may fall behind before losing its subscription.
    ///
    /// **Default**: 64
    #[serde(default = "default_queue_size")]
    pub default_queue_size: usize,

    /// Largest `queue_size` a subscriber may request
    ///
    /// Requests above this bound are rejected with `BadParameter`.
    ///
    /// **Default**: 65536
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            default_queue_size: default_queue_size(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl FanoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_queue_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "fanout.default_queue_size must be greater than 0".into(),
            )));
        }

        if self.max_queue_size < self.default_queue_size {
            return Err(Error::Config(ConfigError::Message(format!(
                "fanout.max_queue_size ({}) must not be lower than default_queue_size ({})",
                self.max_queue_size, self.default_queue_size
            ))));
        }

        Ok(())
    }
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}
fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}
