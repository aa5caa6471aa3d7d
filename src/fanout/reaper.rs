//! Deferred watcher removal.
//!
//! Emit walks the registries under the fanout read lock, and a consumer may
//! call `Watcher::close` from anywhere, so neither can take the write lock
//! inline. Both publish a [`Reap`] request instead; a dedicated thread drains
//! the queue and performs the removal once the lock is free.

use std::sync::Arc;
use std::sync::Weak;
use std::thread;

use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use tracing::debug;
use tracing::trace;

use super::FanoutInner;
use super::WatcherList;
use super::WatcherShared;
use crate::constants::REAPER_THREAD_NAME;
use crate::Error;
use crate::Resource;
use crate::Result;

pub(crate) enum Reap<R: Resource> {
    /// Drop the watcher from every registry it is listed in, then cancel it
    Remove(Arc<WatcherShared<R>>),
    /// Cancel every watcher of registries already detached from the fanout
    CancelAll(Vec<Arc<WatcherList<R>>>),
}

pub(crate) struct ReaperHandle<R: Resource> {
    tx: Sender<Reap<R>>,
}

// Manual impl: `Sender` is cloneable for any `R`
impl<R: Resource> Clone for ReaperHandle<R> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<R: Resource> ReaperHandle<R> {
    pub(crate) fn channel() -> (Self, Receiver<Reap<R>>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    pub(crate) fn remove(
        &self,
        watcher: Arc<WatcherShared<R>>,
    ) {
        if let Err(e) = self.tx.send(Reap::Remove(watcher)) {
            // Reaper is gone, which only happens once the fanout itself is gone
            if let Reap::Remove(watcher) = e.into_inner() {
                watcher.cancel();
            }
        }
    }

    pub(crate) fn cancel_all(
        &self,
        lists: Vec<Arc<WatcherList<R>>>,
    ) {
        if let Err(e) = self.tx.send(Reap::CancelAll(lists)) {
            if let Reap::CancelAll(lists) = e.into_inner() {
                cancel_lists(&lists);
            }
        }
    }
}

/// Starts the reaper thread.
///
/// The thread keeps only a weak reference to the fanout and exits once every
/// `ReaperHandle` (owned by the fanout and by live watchers) is dropped.
pub(crate) fn spawn<R: Resource>(
    fanout: Weak<FanoutInner<R>>,
    rx: Receiver<Reap<R>>,
) -> Result<()> {
    thread::Builder::new()
        .name(REAPER_THREAD_NAME.to_string())
        .spawn(move || run(fanout, rx))
        .map(|_| ())
        .map_err(|source| Error::Spawn {
            name: REAPER_THREAD_NAME,
            source,
        })
}

fn run<R: Resource>(
    fanout: Weak<FanoutInner<R>>,
    rx: Receiver<Reap<R>>,
) {
    debug!("Fanout reaper thread started");

    for reap in rx.iter() {
        match reap {
            Reap::Remove(watcher) => match fanout.upgrade() {
                Some(inner) => inner.remove_watcher(&watcher),
                None => watcher.cancel(),
            },
            Reap::CancelAll(lists) => {
                cancel_lists(&lists);
            }
        }
    }

    debug!("Fanout reaper thread stopped");
}

fn cancel_lists<R: Resource>(lists: &[Arc<WatcherList<R>>]) {
    let mut cancelled = 0usize;
    for list in lists {
        list.iter(|entry| {
            entry.watcher.cancel();
            cancelled += 1;
        });
    }
    trace!(entries = cancelled, "Cancelled detached watchers");
}
