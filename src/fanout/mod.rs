//! Event fan-out.
//!
//! A [`Fanout`] takes one ordered stream of events and delivers each event to
//! every [`Watcher`] whose subscription matches it. Watchers are sharded by
//! resource kind into per-kind registries so that an event only visits the
//! watchers of its own kind.
//!
//! Delivery happens on the emitting thread, under the fanout's read lock,
//! into each watcher's bounded queue with `try_send`. Everything that would
//! need the write lock from that path (evicting a slow watcher, a consumer
//! closing its handle) is deferred to the reaper thread.

mod manager;
mod reaper;
mod registry;
mod watcher;

pub use manager::*;
pub(crate) use reaper::*;
pub(crate) use registry::*;
pub use watcher::Watcher;
pub(crate) use watcher::WatcherShared;
