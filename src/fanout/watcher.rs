use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::trace;
use tracing::warn;

use super::ReaperHandle;
use crate::metrics::WATCHER_EVICTIONS;
use crate::Event;
use crate::Resource;
use crate::Result;
use crate::WatchError;
use crate::WatchSpec;

/// Fanout-side state of a subscriber.
///
/// Shared between the registry entries (one per watched kind) and the
/// consumer's [`Watcher`].
pub(crate) struct WatcherShared<R: Resource> {
    id: u64,
    spec: WatchSpec,
    capacity: usize,
    sender: mpsc::Sender<Event<R>>,
    token: CancellationToken,
    /// Outcome of the one and only attempt to queue the init event
    init_sent: OnceLock<bool>,
    error: Mutex<Option<WatchError>>,
    removal_scheduled: AtomicBool,
    reaper: ReaperHandle<R>,
}

impl<R: Resource> WatcherShared<R> {
    pub(crate) fn new(
        id: u64,
        spec: WatchSpec,
        capacity: usize,
        token: CancellationToken,
        reaper: ReaperHandle<R>,
    ) -> (Arc<Self>, mpsc::Receiver<Event<R>>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let shared = Arc::new(Self {
            id,
            spec,
            capacity,
            sender,
            token,
            init_sent: OnceLock::new(),
            error: Mutex::new(None),
            removal_scheduled: AtomicBool::new(false),
            reaper,
        });
        (shared, receiver)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn spec(&self) -> &WatchSpec {
        &self.spec
    }

    /// Queues the init event; safe to call more than once.
    pub(crate) fn init(&self) -> bool {
        *self
            .init_sent
            .get_or_init(|| self.sender.try_send(Event::init()).is_ok())
    }

    /// Non-blocking delivery
    pub(crate) fn emit(
        &self,
        event: Event<R>,
    ) -> std::result::Result<(), WatchError> {
        if self.token.is_cancelled() {
            return Err(WatchError::Closed);
        }
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(WatchError::BufferOverflow {
                capacity: self.capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(WatchError::Closed),
        }
    }

    /// Keeps the first error: a later `Closed` must not hide the real cause.
    pub(crate) fn set_error(
        &self,
        err: WatchError,
    ) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn error(&self) -> Option<WatchError> {
        if let Some(err) = self.error.lock().clone() {
            return Some(err);
        }
        self.token.is_cancelled().then_some(WatchError::Closed)
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Records `err` and cancels without touching the registry.
    pub(crate) fn fail(
        &self,
        err: WatchError,
    ) {
        WATCHER_EVICTIONS.with_label_values(&[err.reason()]).inc();
        self.set_error(err);
        self.cancel();
        // already out of the registry, nothing left for the reaper
        self.removal_scheduled.store(true, Ordering::Release);
    }

    /// Tears the watcher down from the emit path.
    ///
    /// The token is cancelled right away so that the consumer and later emit
    /// passes see it; registry removal is handed to the reaper because the
    /// caller still holds the fanout lock.
    pub(crate) fn evict(
        self: &Arc<Self>,
        err: WatchError,
    ) {
        warn!(
            watcher_id = self.id,
            watcher = %self.spec.name,
            reason = err.reason(),
            error = %err,
            "Evicting watcher"
        );
        WATCHER_EVICTIONS.with_label_values(&[err.reason()]).inc();
        self.set_error(err);
        self.cancel();
        self.schedule_removal();
    }

    pub(crate) fn schedule_removal(self: &Arc<Self>) {
        if self.removal_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reaper.remove(self.clone());
    }

    /// Number of registry entries this watcher occupies
    pub(crate) fn kind_count(&self) -> usize {
        self.spec.kinds.len()
    }
}

impl<R: Resource> fmt::Debug for WatcherShared<R> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WatcherShared")
            .field("id", &self.id)
            .field("name", &self.spec.name)
            .field("capacity", &self.capacity)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Subscriber handle returned by [`Fanout::new_watcher`](crate::Fanout::new_watcher).
///
/// Events arrive in emit order on a bounded queue. A watcher that lets its
/// queue fill up is evicted rather than slowing down the producer: its
/// [`done`](Self::done) future resolves and [`error`](Self::error) reports
/// why. There is no automatic resubscription; create a new watcher to start
/// over from a fresh `Init` event.
///
/// Dropping the handle closes it.
pub struct Watcher<R: Resource> {
    shared: Arc<WatcherShared<R>>,
    events: mpsc::Receiver<Event<R>>,
}

impl<R: Resource> Watcher<R> {
    pub(crate) fn new(
        shared: Arc<WatcherShared<R>>,
        events: mpsc::Receiver<Event<R>>,
    ) -> Self {
        Self { shared, events }
    }

    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    pub fn spec(&self) -> &WatchSpec {
        self.shared.spec()
    }

    /// Raw event queue, for callers that `select!` on it together with
    /// [`done`](Self::done).
    ///
    /// ```ignore
    /// let done = watcher.done();
    /// tokio::pin!(done);
    /// loop {
    ///     tokio::select! {
    ///         _ = &mut done => break,
    ///         Some(event) = watcher.events().recv() => handle(event),
    ///     }
    /// }
    /// ```
    pub fn events(&mut self) -> &mut mpsc::Receiver<Event<R>> {
        &mut self.events
    }

    /// Next event, or `None` once the watcher has been torn down.
    ///
    /// Teardown wins over queued events.
    pub async fn recv(&mut self) -> Option<Event<R>> {
        tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn try_recv(&mut self) -> std::result::Result<Event<R>, TryRecvError> {
        self.events.try_recv()
    }

    /// Resolves when the watcher is torn down for any reason, including
    /// cancellation of the parent token it was created with.
    ///
    /// The future owns its handle on the token, so it does not borrow the
    /// watcher.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.shared.token.clone().cancelled_owned()
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Stops the watcher and schedules its removal from the fanout.
    ///
    /// Never waits for the fanout lock; removal happens on the reaper thread.
    pub fn close(&self) -> Result<()> {
        trace!(watcher_id = self.shared.id(), "Watcher closed by consumer");
        self.shared.cancel();
        self.shared.schedule_removal();
        Ok(())
    }

    /// Why the watcher stopped, or `None` while it is healthy
    pub fn error(&self) -> Option<WatchError> {
        self.shared.error()
    }
}

impl<R: Resource> Drop for Watcher<R> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<R: Resource> fmt::Debug for Watcher<R> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Watcher").field("shared", &self.shared).finish()
    }
}
