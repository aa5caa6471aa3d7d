use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::mem;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::reaper;
use super::FanoutEntry;
use super::ReaperHandle;
use super::Watcher;
use super::WatcherList;
use super::WatcherShared;
use crate::metrics::EVENTS_EMITTED;
use crate::metrics::WATCHERS_REGISTERED;
use crate::Error;
use crate::Event;
use crate::FanoutConfig;
use crate::Resource;
use crate::Result;
use crate::WatchError;
use crate::WatchKind;
use crate::WatchSpec;

/// Label used for events that are not tied to a resource kind
const BROADCAST_LABEL: &str = "*";

/// Lifecycle of a [`Fanout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Watchers are queued; `emit` is a contract violation
    Uninitialized,
    /// Live: watchers get `Init` on registration and receive events
    Initialized,
    /// Terminal: registrations are rejected
    Closed,
}

/// Notification published to the optional observer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutEvent {
    /// A watcher was taken out of the registries
    WatcherRemoved { watcher_id: u64 },
}

struct FanoutState<R: Resource> {
    phase: Phase,
    watchers: HashMap<String, Arc<WatcherList<R>>>,
}

impl<R: Resource> FanoutState<R> {
    fn covers(
        &self,
        kinds: &[WatchKind],
    ) -> bool {
        kinds.iter().all(|k| self.watchers.contains_key(&k.kind))
    }

    fn ensure_lists(
        &mut self,
        kinds: &[WatchKind],
    ) {
        for kind in kinds {
            self.watchers
                .entry(kind.kind.clone())
                .or_insert_with(|| Arc::new(WatcherList::new()));
        }
    }

    /// Phase check, init event, then one registry entry per watched kind.
    ///
    /// Requires a list for every kind of the watcher (see `ensure_lists`).
    fn register(
        &self,
        watcher: &Arc<WatcherShared<R>>,
    ) -> Result<()> {
        match self.phase {
            Phase::Closed => return Err(Error::FanoutClosed),
            Phase::Initialized => {
                // fanout is already live; the watcher must get its init event now
                if !watcher.init() {
                    watcher.fail(WatchError::InitFailed);
                    return Err(Error::BadParameter("failed to send init event".into()));
                }
            }
            Phase::Uninitialized => {}
        }

        for kind in &watcher.spec().kinds {
            if let Some(list) = self.watchers.get(&kind.kind) {
                list.add(FanoutEntry::new(kind.clone(), watcher.clone()));
            }
        }
        Ok(())
    }

    /// Returns true if the watcher was found in at least one registry
    fn remove_watcher(
        &mut self,
        watcher: &WatcherShared<R>,
    ) -> bool {
        let mut found = 0;
        for kind in &watcher.spec().kinds {
            let empty = match self.watchers.get(&kind.kind) {
                Some(list) => {
                    found += list.remove(watcher.id());
                    if list.needs_compaction() {
                        list.compact();
                    }
                    list.is_empty()
                }
                None => false,
            };
            if empty {
                self.watchers.remove(&kind.kind);
            }
        }
        found > 0
    }

    fn len(&self) -> usize {
        self.watchers.values().map(|list| list.len()).sum()
    }
}

pub(crate) struct FanoutInner<R: Resource> {
    state: RwLock<FanoutState<R>>,
    config: FanoutConfig,
    next_id: AtomicU64,
    reaper: ReaperHandle<R>,
    observer: Option<mpsc::Sender<FanoutEvent>>,
}

impl<R: Resource> FanoutInner<R> {
    /// Reaper entry point: registry removal under the write lock, then cancellation.
    pub(crate) fn remove_watcher(
        &self,
        watcher: &Arc<WatcherShared<R>>,
    ) {
        let removed = self.state.write().remove_watcher(watcher);
        watcher.cancel();
        if removed {
            trace!(watcher_id = watcher.id(), "Watcher removed");
            self.notify(FanoutEvent::WatcherRemoved {
                watcher_id: watcher.id(),
            });
        }
    }

    fn notify(
        &self,
        event: FanoutEvent,
    ) {
        if let Some(observer) = &self.observer {
            let _ = observer.try_send(event);
        }
    }

    /// Moves the registries out and hands them to the reaper for cancellation.
    ///
    /// The old watchers never observe anything that happens to the fanout
    /// afterwards, so new registrations may proceed while they are cancelled.
    fn close_watchers_async(
        &self,
        state: &mut FanoutState<R>,
    ) {
        let lists: Vec<_> = mem::take(&mut state.watchers).into_values().collect();
        if !lists.is_empty() {
            self.reaper.cancel_all(lists);
        }
    }

    fn queue_size(
        &self,
        spec: &WatchSpec,
    ) -> Result<usize> {
        if spec.kinds.is_empty() {
            return Err(Error::BadParameter(
                "must specify at least one resource kind to watch".into(),
            ));
        }
        if spec.kinds.iter().any(|k| k.kind.is_empty()) {
            return Err(Error::BadParameter("resource kind must not be empty".into()));
        }
        match spec.queue_size {
            0 => Ok(self.config.default_queue_size),
            n if n > self.config.max_queue_size => Err(Error::BadParameter(format!(
                "queue size {} exceeds the maximum of {}",
                n, self.config.max_queue_size
            ))),
            n => Ok(n),
        }
    }
}

/// Fans a single ordered stream of events out to many watchers.
///
/// The component bridging a backend to the fanout drives its lifecycle:
/// [`set_init`](Self::set_init) once the upstream feed is live,
/// [`emit`](Self::emit) for every change, [`reset`](Self::reset) when the feed
/// breaks and has to be replayed, and [`close`](Self::close) on shutdown.
///
/// The producer never waits for a consumer. A watcher whose queue is full, or
/// whose filter cannot be evaluated, is evicted on the spot while every other
/// watcher keeps receiving.
///
/// # Example
///
/// ```ignore
/// let fanout: Fanout<ResourceRecord> = Fanout::new(FanoutConfig::default())?;
/// fanout.set_init();
///
/// let mut watcher = fanout.new_watcher(WatchSpec::new("cache").with_kind(WatchKind::new("node")))?;
/// fanout.emit(&[Event::put(ResourceRecord::new("node", "n1"))]);
///
/// assert_eq!(watcher.recv().await.unwrap().op, OpType::Init);
/// assert_eq!(watcher.recv().await.unwrap().op, OpType::Put);
/// ```
pub struct Fanout<R: Resource> {
    inner: Arc<FanoutInner<R>>,
}

// Manual impl: cloning shares the same fanout for any `R`
impl<R: Resource> Clone for Fanout<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Resource> Fanout<R> {
    /// Creates an uninitialized fanout. Until [`set_init`](Self::set_init) is
    /// called, watchers are queued but no events are sent.
    pub fn new(config: FanoutConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Like [`new`](Self::new), also reporting watcher removals on `observer`.
    ///
    /// Notifications are dropped when the observer queue is full.
    pub fn with_observer(
        config: FanoutConfig,
        observer: mpsc::Sender<FanoutEvent>,
    ) -> Result<Self> {
        Self::build(config, Some(observer))
    }

    fn build(
        config: FanoutConfig,
        observer: Option<mpsc::Sender<FanoutEvent>>,
    ) -> Result<Self> {
        config.validate()?;

        let (reaper, reaper_rx) = ReaperHandle::channel();
        let inner = Arc::new(FanoutInner {
            state: RwLock::new(FanoutState {
                phase: Phase::Uninitialized,
                watchers: HashMap::new(),
            }),
            config,
            next_id: AtomicU64::new(1),
            reaper,
            observer,
        });
        reaper::spawn(Arc::downgrade(&inner), reaper_rx)?;

        Ok(Self { inner })
    }

    /// Attaches a new watcher that lives until it is closed, evicted or the
    /// fanout is reset.
    ///
    /// On an initialized fanout the `Init` event is queued before this returns;
    /// otherwise it is sent by [`set_init`](Self::set_init).
    pub fn new_watcher(
        &self,
        spec: WatchSpec,
    ) -> Result<Watcher<R>> {
        self.attach(spec, CancellationToken::new())
    }

    /// Like [`new_watcher`](Self::new_watcher), but the watcher is also torn
    /// down when `parent` is cancelled.
    ///
    /// The watcher's [`done`](Watcher::done) resolves as soon as the parent is
    /// cancelled. Its registry entries are reclaimed by the next
    /// [`emit`](Self::emit) that reaches them.
    pub fn new_watcher_with_parent(
        &self,
        parent: &CancellationToken,
        spec: WatchSpec,
    ) -> Result<Watcher<R>> {
        self.attach(spec, parent.child_token())
    }

    fn attach(
        &self,
        spec: WatchSpec,
        token: CancellationToken,
    ) -> Result<Watcher<R>> {
        let queue_size = self.inner.queue_size(&spec)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (shared, events) = WatcherShared::new(id, spec, queue_size, token, self.inner.reaper.clone());

        let registered = {
            let state = self.inner.state.read();
            if state.covers(&shared.spec().kinds) {
                Some(state.register(&shared))
            } else {
                None
            }
        };

        // Some kind has no registry yet: create it under the write lock
        let registered = match registered {
            Some(result) => result,
            None => {
                let mut state = self.inner.state.write();
                if state.phase != Phase::Closed {
                    state.ensure_lists(&shared.spec().kinds);
                }
                state.register(&shared)
            }
        };

        if let Err(e) = registered {
            shared.cancel();
            return Err(e);
        }

        WATCHERS_REGISTERED.inc();
        debug!(
            watcher_id = id,
            watcher = %shared.spec().name,
            kinds = shared.kind_count(),
            queue_size,
            "Watcher registered"
        );
        Ok(Watcher::new(shared, events))
    }

    /// Puts the fanout into the initialized state and sends `Init` to every
    /// watcher added before this call. Idempotent.
    ///
    /// A queued watcher that cannot take even its init event is removed and
    /// cancelled.
    pub fn set_init(&self) {
        let mut state = self.inner.state.write();
        if state.phase != Phase::Uninitialized {
            return;
        }

        let mut failed: HashMap<u64, Arc<WatcherShared<R>>> = HashMap::new();
        for list in state.watchers.values() {
            list.iter(|entry| {
                if !entry.watcher.init() {
                    failed.insert(entry.watcher.id(), entry.watcher.clone());
                }
            });
        }
        for (watcher_id, watcher) in failed {
            state.remove_watcher(&watcher);
            watcher.fail(WatchError::InitFailed);
            self.inner.notify(FanoutEvent::WatcherRemoved { watcher_id });
        }

        state.phase = Phase::Initialized;
        info!(watchers = state.len(), "Fanout initialized");
    }

    /// Broadcasts events to every matching watcher.
    ///
    /// Delivery never blocks: a watcher that cannot take an event is evicted.
    ///
    /// # Panics
    ///
    /// Panics if the fanout has not been initialized. Events emitted after
    /// [`close`](Self::close) are dropped.
    pub fn emit(
        &self,
        events: &[Event<R>],
    ) {
        let state = self.inner.state.read();
        match state.phase {
            Phase::Uninitialized => panic!("emit called on uninitialized fanout instance"),
            Phase::Closed => {
                debug!(events = events.len(), "Fanout closed, dropping events");
                return;
            }
            Phase::Initialized => {}
        }

        for full in events {
            // by default watchers get the secret-free projection
            let redacted = full.without_secrets();
            let mut delivered = HashSet::new();

            match full.resource.as_deref() {
                None => {
                    // not tied to a kind: every watcher gets it, once
                    for list in state.watchers.values() {
                        list.iter(|entry| {
                            let watcher = &entry.watcher;
                            if watcher.is_cancelled() {
                                watcher.schedule_removal();
                                return;
                            }
                            if watcher.kind_count() > 1 && !delivered.insert(watcher.id()) {
                                return;
                            }
                            if let Err(err) = watcher.emit(full.clone()) {
                                watcher.evict(err);
                            }
                        });
                    }
                    EVENTS_EMITTED.with_label_values(&[BROADCAST_LABEL]).inc();
                }
                Some(resource) => {
                    EVENTS_EMITTED.with_label_values(&[resource.kind()]).inc();
                    let Some(list) = state.watchers.get(resource.kind()) else {
                        continue;
                    };

                    list.iter(|entry| {
                        let watcher = &entry.watcher;
                        if watcher.is_cancelled() {
                            // parent cancellation never reaches the reaper on its own
                            watcher.schedule_removal();
                            return;
                        }
                        if watcher.kind_count() > 1 && delivered.contains(&watcher.id()) {
                            return;
                        }
                        match entry.matches(resource) {
                            Ok(true) => {}
                            Ok(false) => return,
                            Err(err) => {
                                watcher.evict(err);
                                return;
                            }
                        }
                        if watcher.kind_count() > 1 {
                            delivered.insert(watcher.id());
                        }

                        let event = if entry.kind.load_secrets {
                            full.clone()
                        } else {
                            redacted.clone()
                        };
                        if let Err(err) = watcher.emit(event) {
                            watcher.evict(err);
                        }
                    });
                }
            }
        }
    }

    /// Closes every attached watcher and returns to the uninitialized state.
    ///
    /// May be called on an uninitialized fanout to drop queued watchers. On a
    /// closed fanout it only cancels.
    pub fn reset(&self) {
        let mut state = self.inner.state.write();
        self.inner.close_watchers_async(&mut state);
        if state.phase == Phase::Initialized {
            state.phase = Phase::Uninitialized;
        }
        info!("Fanout reset");
    }

    /// Permanently closes the fanout. Existing watchers are closed and no new
    /// watchers can be added.
    pub fn close(&self) {
        let mut state = self.inner.state.write();
        self.inner.close_watchers_async(&mut state);
        state.phase = Phase::Closed;
        info!("Fanout closed");
    }

    /// Total number of registry entries across all kinds
    pub fn len(&self) -> usize {
        self.inner.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.read().phase
    }

    pub fn is_initialized(&self) -> bool {
        self.phase() == Phase::Initialized
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }
}

impl<R: Resource> fmt::Debug for Fanout<R> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Fanout")
            .field("phase", &state.phase)
            .field("kinds", &state.watchers.len())
            .field("entries", &state.len())
            .finish()
    }
}
