use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Configuration for the backend → fanout [`Relay`](crate::Relay)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Queue capacity requested for the relay's own backend watcher
    ///
    /// The relay is the single upstream consumer, so this should comfortably
    /// absorb write bursts; a full queue makes the backend drop the feed and
    /// forces a full reset of every downstream watcher.
    ///
    /// **Default**: 1024
    #[serde(default = "default_watch_queue_size")]
    pub watch_queue_size: usize,

    /// Key prefixes to subscribe to (empty means the whole keyspace)
    #[serde(default)]
    pub prefixes: Vec<String>,

    /// Reconnect policy after the change feed breaks
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            watch_queue_size: default_watch_queue_size(),
            prefixes: Vec::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.watch_queue_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "relay.watch_queue_size must be greater than 0".into(),
            )));
        }

        if self.prefixes.iter().any(|p| p.is_empty()) {
            return Err(Error::Config(ConfigError::Message(
                "relay.prefixes must not contain empty prefixes".into(),
            )));
        }

        self.backoff.validate()
    }
}

fn default_watch_queue_size() -> usize {
    1024
}
