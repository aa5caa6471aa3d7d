// -
// Watcher queues

/// Per-watcher queue capacity used when neither the `WatchSpec` nor the config sets one
pub(crate) const DEFAULT_QUEUE_SIZE: usize = 64;

/// Upper bound accepted for a single watcher queue
pub(crate) const DEFAULT_MAX_QUEUE_SIZE: usize = 65_536;

// -
// Registry

/// Slots per registry segment
pub(crate) const SEGMENT_SIZE: usize = 16;

// -
// Threads

pub(crate) const REAPER_THREAD_NAME: &str = "fanwatch-reaper";

// -
// Backend keys

/// Separator of the `/<kind>/<name>` key layout
pub(crate) const KEY_SEPARATOR: u8 = b'/';

/// Environment variable prefix for configuration overrides
pub(crate) const ENV_PREFIX: &str = "FANWATCH";
