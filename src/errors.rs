//! Fan-out Error Hierarchy
//!
//! Errors returned synchronously to callers (`Error`) are kept apart from the
//! per-watcher failure causes (`WatchError`) that are only ever observed lazily
//! through `Watcher::error`.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed subscription or configuration request
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Registration attempted after the fanout was permanently closed
    #[error("cannot register watcher, fanout system closed")]
    FanoutClosed,

    /// Failure local to a single watcher
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Change feed and codec failures
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Background thread could not be started
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Reason a watcher was torn down by the fanout.
///
/// Cloned out of the watcher's error slot on every `Watcher::error` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// Consumer did not keep up; its queue was full at delivery time
    #[error("buffer overflow: watcher queue of {capacity} events is full")]
    BufferOverflow { capacity: usize },

    /// The watcher's filter could not be evaluated
    #[error("failed to match {kind} event: {reason}")]
    Match { kind: String, reason: String },

    /// The init event could not be queued
    #[error("failed to send init event")]
    InitFailed,

    /// Closed by the consumer, or by a fanout reset/close
    #[error("watcher closed")]
    Closed,
}

impl WatchError {
    /// Short label used for metrics and structured logs
    pub fn reason(&self) -> &'static str {
        match self {
            WatchError::BufferOverflow { .. } => "buffer_overflow",
            WatchError::Match { .. } => "match",
            WatchError::InitFailed => "init_failed",
            WatchError::Closed => "closed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The change feed ended or the watcher was evicted by the backend
    #[error("backend watcher closed")]
    WatcherClosed,

    /// Key does not follow the `/<kind>/<name>` layout
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Value could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] bincode::Error),

    /// Item missing from the store
    #[error("key {0:?} is not found")]
    NotFound(String),

    /// Relay gave up reconnecting
    #[error("Change feed failed after {0} consecutive retries")]
    RetriesExhausted(usize),
}
