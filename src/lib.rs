//! In-process event fan-out.
//!
//! A single ordered stream of resource change events, typically produced by a
//! [`Relay`] following a backend change feed, is delivered to many concurrent
//! [`Watcher`]s. Each watcher subscribes to one or more resource kinds,
//! optionally narrowed by name, sub-kind and label selectors, and receives
//! matching events in order on its own bounded queue.
//!
//! A watcher that falls behind is evicted instead of slowing down the
//! producer or its peers; it observes the eviction through
//! [`Watcher::done`] and [`Watcher::error`].

mod backend;
mod config;
mod constants;
mod errors;
mod event;
mod fanout;
mod relay;
mod watch;

pub mod metrics;

pub use backend::*;
pub use self::config::*;
pub use errors::*;
pub use event::*;
pub use fanout::*;
pub use relay::*;
pub use watch::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
