//! Per-kind watcher registry.
//!
//! A segmented, append-only list: fixed-size segments linked from newest to
//! oldest. Readers walk the chain without taking any lock and only look at
//! slots that have been claimed and published. Writers claim a slot in the
//! head segment with a CAS on its `claimed` counter; when the head is full a
//! new segment is prepended by swapping the head pointer, and a writer that
//! loses that race simply retries.
//!
//! Removal never frees memory in place: entries are tombstoned and the live
//! count is decremented. Once a segment's worth of tombstones has piled up the
//! fanout rebuilds the chain with [`WatcherList::compact`] while it holds its
//! write lock, so no reader or writer can observe the swap half-way.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use arc_swap::ArcSwap;

use super::WatcherShared;
use crate::constants::SEGMENT_SIZE;
use crate::LabelSelector;
use crate::Resource;
use crate::SelectorError;
use crate::WatchError;
use crate::WatchKind;

/// One (kind filter, watcher) pair stored in a registry
pub(crate) struct FanoutEntry<R: Resource> {
    pub(crate) kind: WatchKind,
    pub(crate) watcher: Arc<WatcherShared<R>>,
    /// Compiled lazily on the first event this entry is asked to match
    selector: OnceLock<Result<LabelSelector, SelectorError>>,
    closed: AtomicBool,
}

impl<R: Resource> FanoutEntry<R> {
    pub(crate) fn new(
        kind: WatchKind,
        watcher: Arc<WatcherShared<R>>,
    ) -> Self {
        Self {
            kind,
            watcher,
            selector: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Evaluates this entry's filter against `resource`.
    ///
    /// A filter that fails to compile is an error for this watcher only.
    pub(crate) fn matches(
        &self,
        resource: &R,
    ) -> Result<bool, WatchError> {
        let selector = self
            .selector
            .get_or_init(|| self.kind.selector())
            .as_ref()
            .map_err(|e| WatchError::Match {
                kind: self.kind.kind.clone(),
                reason: e.to_string(),
            })?;
        Ok(self.kind.matches(selector, resource))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct Segment<R: Resource> {
    slots: Box<[OnceLock<Arc<FanoutEntry<R>>>]>,
    /// Number of slots handed out; may run ahead of the published slots
    claimed: AtomicUsize,
    next: Option<Arc<Segment<R>>>,
}

impl<R: Resource> Segment<R> {
    fn new(next: Option<Arc<Segment<R>>>) -> Self {
        Self {
            slots: (0..SEGMENT_SIZE).map(|_| OnceLock::new()).collect(),
            claimed: AtomicUsize::new(0),
            next,
        }
    }

    fn with_first(
        entry: Arc<FanoutEntry<R>>,
        next: Option<Arc<Segment<R>>>,
    ) -> Self {
        let segment = Self::new(next);
        let _ = segment.slots[0].set(entry);
        segment.claimed.store(1, Ordering::Release);
        segment
    }

    /// Claims a free slot and publishes `entry` into it.
    ///
    /// Returns false once the segment is full.
    fn try_push(
        &self,
        entry: &Arc<FanoutEntry<R>>,
    ) -> bool {
        let claimed = self.claimed.fetch_update(Ordering::AcqRel, Ordering::Acquire, |slot| {
            (slot < SEGMENT_SIZE).then_some(slot + 1)
        });
        match claimed {
            Ok(slot) => {
                // A claimed slot is written exactly once
                let _ = self.slots[slot].set(entry.clone());
                true
            }
            Err(_) => false,
        }
    }

    /// Published entries; a claimed slot that is not written yet is skipped.
    fn entries(&self) -> impl Iterator<Item = &Arc<FanoutEntry<R>>> {
        let top = self.claimed.load(Ordering::Acquire).min(SEGMENT_SIZE);
        self.slots[..top].iter().filter_map(OnceLock::get)
    }
}

/// Watchers interested in one resource kind
pub(crate) struct WatcherList<R: Resource> {
    head: ArcSwap<Segment<R>>,
    live: AtomicUsize,
    tombstones: AtomicUsize,
}

impl<R: Resource> WatcherList<R> {
    pub(crate) fn new() -> Self {
        Self {
            head: ArcSwap::from_pointee(Segment::new(None)),
            live: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
        }
    }

    pub(crate) fn add(
        &self,
        entry: FanoutEntry<R>,
    ) {
        let entry = Arc::new(entry);
        loop {
            let head = self.head.load_full();
            if head.try_push(&entry) {
                break;
            }

            let fresh = Arc::new(Segment::with_first(entry.clone(), Some(head.clone())));
            let prev = self.head.compare_and_swap(&head, fresh);
            if Arc::ptr_eq(&*prev, &head) {
                break;
            }
        }
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    /// Visits every live entry.
    ///
    /// Entries added while the walk is in progress may or may not be visited.
    pub(crate) fn iter<F>(
        &self,
        mut f: F,
    ) where
        F: FnMut(&Arc<FanoutEntry<R>>),
    {
        let mut segment = Some(self.head.load_full());
        while let Some(current) = segment {
            for entry in current.entries() {
                if !entry.is_closed() {
                    f(entry);
                }
            }
            segment = current.next.clone();
        }
    }

    /// Tombstones every entry of the given watcher, returns how many were found.
    pub(crate) fn remove(
        &self,
        watcher_id: u64,
    ) -> usize {
        let mut removed = 0;
        self.iter(|entry| {
            if entry.watcher.id() == watcher_id && !entry.closed.swap(true, Ordering::AcqRel) {
                removed += 1;
            }
        });

        if removed > 0 {
            self.live.fetch_sub(removed, Ordering::AcqRel);
            self.tombstones.fetch_add(removed, Ordering::AcqRel);
        }
        removed
    }

    pub(crate) fn needs_compaction(&self) -> bool {
        self.tombstones.load(Ordering::Acquire) >= SEGMENT_SIZE
    }

    /// Rebuilds the chain from live entries only.
    ///
    /// Caller must guarantee that no `add` or `iter` runs concurrently.
    pub(crate) fn compact(&self) {
        let mut live = Vec::with_capacity(self.len());
        self.iter(|entry| live.push(entry.clone()));

        // oldest first, so the rebuilt chain keeps the newest entries at the head
        let mut head = Arc::new(Segment::new(None));
        for entry in live.into_iter().rev() {
            if !head.try_push(&entry) {
                head = Arc::new(Segment::with_first(entry, Some(head)));
            }
        }

        self.head.store(head);
        self.tombstones.store(0, Ordering::Release);
    }

    /// Live entries (approximate under concurrent mutation)
    pub(crate) fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        let mut count = 0;
        let mut segment = Some(self.head.load_full());
        while let Some(current) = segment {
            count += 1;
            segment = current.next.clone();
        }
        count
    }
}
