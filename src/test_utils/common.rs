use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

use crate::FanoutConfig;
use crate::FanoutEvent;
use crate::ResourceRecord;
use crate::Watcher;

pub(crate) const WAIT: Duration = Duration::from_secs(2);

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub(crate) fn small_config(default_queue_size: usize) -> FanoutConfig {
    FanoutConfig {
        default_queue_size,
        ..FanoutConfig::default()
    }
}

pub(crate) fn node(name: &str) -> ResourceRecord {
    ResourceRecord::new("node", name)
}

/// Next event, failing the test if nothing arrives in time
pub(crate) async fn next_event(
    watcher: &mut Watcher<ResourceRecord>
) -> Option<crate::Event<ResourceRecord>> {
    timeout(WAIT, watcher.recv()).await.expect("event in time")
}

/// Waits for the reaper to report the removal of `watcher_id`
pub(crate) async fn wait_removed(
    observer: &mut mpsc::Receiver<FanoutEvent>,
    watcher_id: u64,
) {
    timeout(WAIT, async {
        while let Some(event) = observer.recv().await {
            if event == (FanoutEvent::WatcherRemoved { watcher_id }) {
                return;
            }
        }
        panic!("observer channel closed");
    })
    .await
    .expect("watcher removed in time")
}
