use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::Backend;
use super::BackendEvent;
use super::BackendWatch;
use super::BackendWatcher;
use super::Item;
use crate::BackendError;
use crate::Error;
use crate::OpType;
use crate::Result;

struct FeedSender {
    watch: BackendWatch,
    sender: mpsc::Sender<BackendEvent>,
    token: CancellationToken,
}

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<Bytes, Item>,
    revision: u64,
    feeds: Vec<FeedSender>,
}

impl MemoryState {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Delivers `event` to every matching feed, dropping feeds that are gone
    /// or cannot keep up.
    fn publish(
        &mut self,
        event: BackendEvent,
    ) {
        self.feeds.retain(|feed| {
            if feed.token.is_cancelled() {
                return false;
            }
            if !feed.watch.matches(&event.item.key) {
                return true;
            }
            match feed.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        watcher = %feed.watch.name,
                        capacity = feed.watch.queue_size,
                        "Backend watcher is lagging behind, closing feed"
                    );
                    feed.token.cancel();
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    feed.token.cancel();
                    false
                }
            }
        });
    }
}

/// Ordered in-memory store with change feeds.
///
/// Cloning shares the same store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces an item; returns the revision assigned to it
    pub fn put(
        &self,
        mut item: Item,
    ) -> u64 {
        let mut state = self.state.lock();
        item.revision = state.next_revision();
        let revision = item.revision;
        trace!(key = ?item.key, revision, "put");

        state.items.insert(item.key.clone(), item.clone());
        state.publish(BackendEvent { op: OpType::Put, item });
        revision
    }

    pub fn get(
        &self,
        key: &[u8],
    ) -> Result<Item> {
        self.state
            .lock()
            .items
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(String::from_utf8_lossy(key).into_owned()).into())
    }

    pub fn delete(
        &self,
        key: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let Some(removed) = state.items.remove(key) else {
            return Err(BackendError::NotFound(String::from_utf8_lossy(key).into_owned()).into());
        };
        let revision = state.next_revision();
        trace!(key = ?removed.key, revision, "delete");

        state.publish(BackendEvent {
            op: OpType::Delete,
            item: Item {
                key: removed.key,
                revision,
                ..Item::default()
            },
        });
        Ok(())
    }

    /// Items whose key starts with `prefix`, in key order
    pub fn get_range(
        &self,
        prefix: &[u8],
    ) -> Vec<Item> {
        let state = self.state.lock();
        state
            .items
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, item)| item.clone())
            .collect()
    }

    /// Ends every open change feed, as a broken connection would
    pub fn close_watchers(&self) {
        let feeds = std::mem::take(&mut self.state.lock().feeds);
        debug!(feeds = feeds.len(), "Closing backend watchers");
        for feed in feeds {
            feed.token.cancel();
        }
    }

    /// Open change feeds
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.feeds.retain(|feed| !feed.token.is_cancelled());
        state.feeds.len()
    }
}

impl Backend for MemoryBackend {
    fn new_watcher(
        &self,
        watch: BackendWatch,
    ) -> Result<BackendWatcher> {
        if watch.queue_size == 0 {
            return Err(Error::BadParameter("backend watcher queue size must be positive".into()));
        }

        let (sender, receiver) = mpsc::channel(watch.queue_size);
        let token = CancellationToken::new();

        // registered under the same lock as writes: no change slips in before Init
        let mut state = self.state.lock();
        sender
            .try_send(BackendEvent::init())
            .map_err(|_| BackendError::WatcherClosed)?;

        debug!(watcher = %watch.name, prefixes = watch.prefixes.len(), "Backend watcher opened");
        let name = watch.name.clone();
        state.feeds.push(FeedSender {
            watch,
            sender,
            token: token.clone(),
        });

        Ok(BackendWatcher::new(name, receiver, token))
    }
}
