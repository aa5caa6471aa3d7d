//! Bridge from a backend change feed to a [`Fanout`].
//!
//! The relay is the fanout's only producer. It owns the lifecycle the fanout
//! expects: `set_init` once the upstream feed reports `Init`, `emit` for every
//! decoded change, and `reset` as soon as the feed breaks, so that downstream
//! watchers never see a gap. A broken feed is reopened after an exponential
//! backoff with jitter.

mod codec;
pub use codec::*;


use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::BackendEvent;
use crate::backend::BackendWatch;
use crate::backend::BackendWatcher;
use crate::metrics::RELAY_CONNECTED;
use crate::metrics::RELAY_DECODE_FAILURES;
use crate::metrics::RELAY_RESTARTS;
use crate::BackendError;
use crate::BackoffPolicy;
use crate::Error;
use crate::Fanout;
use crate::OpType;
use crate::RelayConfig;
use crate::Resource;
use crate::Result;

/// How a single feed session ended
#[derive(Debug, PartialEq, Eq)]
enum Session {
    /// Shutdown was requested or the fanout was closed
    Stopped,
    /// Feed ended after it had been initialized
    Broken,
    /// Feed could not be opened or ended before `Init`
    Failed,
}

pub struct Relay<B, C, R>
where
    B: Backend,
    C: Codec<R>,
    R: Resource,
{
    backend: B,
    fanout: Fanout<R>,
    codec: C,
    config: RelayConfig,
    _resource: PhantomData<fn() -> R>,
}

impl<B, C, R> Relay<B, C, R>
where
    B: Backend,
    C: Codec<R>,
    R: Resource,
{
    pub fn new(
        backend: B,
        fanout: Fanout<R>,
        codec: C,
        config: RelayConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            fanout,
            codec,
            config,
            _resource: PhantomData,
        })
    }

    pub fn fanout(&self) -> &Fanout<R> {
        &self.fanout
    }

    /// Pumps the change feed into the fanout until `shutdown` fires.
    ///
    /// Closes the fanout on the way out. Fails with
    /// [`BackendError::RetriesExhausted`] once `max_retries` consecutive
    /// attempts failed, when a limit is configured.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let policy = self.config.backoff;
        let mut failures = 0usize;

        let result = loop {
            if shutdown.is_cancelled() || self.fanout.is_closed() {
                break Ok(());
            }

            match self.session(&shutdown).await {
                Session::Stopped => break Ok(()),
                Session::Broken => {
                    // the feed had been live: start counting afresh
                    failures = 1;
                }
                Session::Failed => failures += 1,
            }

            if policy.max_retries > 0 && failures > policy.max_retries {
                error!(failures, "Giving up on the change feed");
                break Err(Error::from(BackendError::RetriesExhausted(failures)));
            }

            let delay = backoff_delay(&policy, failures);
            debug!(failures, delay_ms = delay.as_millis() as u64, "Reopening change feed after backoff");
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        RELAY_CONNECTED.set(0);
        self.fanout.close();
        info!("Relay stopped");
        result
    }

    async fn session(
        &self,
        shutdown: &CancellationToken,
    ) -> Session {
        let mut feed = match self.backend.new_watcher(self.backend_watch()) {
            Ok(feed) => feed,
            Err(e) => {
                warn!("Failed to open change feed: {}", e);
                return Session::Failed;
            }
        };

        match self.next(&mut feed, shutdown).await {
            Some(Some(event)) if event.op == OpType::Init => {}
            Some(Some(event)) => {
                warn!(op = %event.op, "Change feed did not start with init");
                return Session::Failed;
            }
            Some(None) => return Session::Failed,
            None => return Session::Stopped,
        }

        self.fanout.set_init();
        RELAY_CONNECTED.set(1);
        info!(feed = feed.name(), "Change feed initialized");

        loop {
            if self.fanout.is_closed() {
                return Session::Stopped;
            }
            match self.next(&mut feed, shutdown).await {
                Some(Some(event)) => match self.codec.decode(&event) {
                    Ok(Some(decoded)) => self.fanout.emit(std::slice::from_ref(&decoded)),
                    Ok(None) => trace!(key = ?event.item.key, "Ignoring change outside the resource layout"),
                    Err(e) => {
                        RELAY_DECODE_FAILURES.inc();
                        warn!(op = %event.op, key = ?event.item.key, "Skipping undecodable change: {}", e);
                    }
                },
                Some(None) => {
                    warn!("Change feed ended, resetting fanout");
                    RELAY_CONNECTED.set(0);
                    RELAY_RESTARTS.inc();
                    self.fanout.reset();
                    return Session::Broken;
                }
                None => return Session::Stopped,
            }
        }
    }

    /// `None` on shutdown, `Some(None)` when the feed ended
    async fn next(
        &self,
        feed: &mut BackendWatcher,
        shutdown: &CancellationToken,
    ) -> Option<Option<BackendEvent>> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            event = feed.recv() => Some(event),
        }
    }

    fn backend_watch(&self) -> BackendWatch {
        BackendWatch {
            name: "fanout-relay".to_string(),
            prefixes: self.config.prefixes.iter().map(|p| Bytes::from(p.clone())).collect(),
            queue_size: self.config.watch_queue_size,
        }
    }
}

/// Exponential delay for the given attempt (1-based), capped at
/// `max_delay_ms`, with up to half of it taken off at random.
pub(crate) fn backoff_delay(
    policy: &BackoffPolicy,
    attempt: usize,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as u32;
    let delay = policy
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_delay_ms);

    let jittered = rand::thread_rng().gen_range(delay / 2..=delay);
    Duration::from_millis(jittered)
}
