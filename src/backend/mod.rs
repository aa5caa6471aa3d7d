//! Change feed abstraction consumed by the relay.
//!
//! A backend is an ordered key-value store that can stream its changes. Each
//! [`BackendWatcher`] starts with an `Init` event once the feed is live, then
//! delivers every put and delete under its prefixes in revision order. A
//! watcher that falls behind is dropped by the backend, which the consumer
//! observes as the end of the feed.

mod memory;
pub use memory::*;


use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFuture;

use crate::OpType;
use crate::Result;

/// Stored key-value pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub key: Bytes,
    pub value: Bytes,
    pub expires: Option<SystemTime>,
    /// Store revision of the last write; assigned by the backend
    pub revision: u64,
}

impl Item {
    pub fn new(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Self::default()
        }
    }
}

/// A single change in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    pub op: OpType,
    /// Empty for `Init`; only `key` and `revision` are set for deletes
    pub item: Item,
}

impl BackendEvent {
    pub fn init() -> Self {
        Self {
            op: OpType::Init,
            item: Item::default(),
        }
    }
}

/// Change feed subscription request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendWatch {
    /// Diagnostic name
    pub name: String,
    /// Key prefixes to follow; empty follows the whole store
    pub prefixes: Vec<Bytes>,
    pub queue_size: usize,
}

impl BackendWatch {
    pub fn matches(
        &self,
        key: &[u8],
    ) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| key.starts_with(p))
    }
}

/// Source of change feeds
pub trait Backend: Send + Sync + 'static {
    /// Opens a change feed; the first event delivered is always `Init`
    fn new_watcher(
        &self,
        watch: BackendWatch,
    ) -> Result<BackendWatcher>;
}

/// Consumer side of a change feed
pub struct BackendWatcher {
    name: String,
    events: mpsc::Receiver<BackendEvent>,
    token: CancellationToken,
}

impl BackendWatcher {
    /// Pairs a receiver with the token the backend cancels to end the feed
    pub fn new(
        name: impl Into<String>,
        events: mpsc::Receiver<BackendEvent>,
        token: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            events,
            token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next change, or `None` once the feed has ended
    pub async fn recv(&mut self) -> Option<BackendEvent> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for BackendWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for BackendWatcher {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("BackendWatcher")
            .field("name", &self.name)
            .field("done", &self.is_done())
            .finish()
    }
}
