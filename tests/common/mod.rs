use std::time::Duration;

use fanwatch::Event;
use fanwatch::Fanout;
use fanwatch::FanoutConfig;
use fanwatch::FanoutEvent;
use fanwatch::ResourceRecord;
use fanwatch::WatchKind;
use fanwatch::WatchSpec;
use fanwatch::Watcher;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub fn new_fanout() -> (Fanout<ResourceRecord>, mpsc::Receiver<FanoutEvent>) {
    enable_logger();
    let (tx, rx) = mpsc::channel(4096);
    let fanout = Fanout::with_observer(FanoutConfig::default(), tx).expect("default config is valid");
    (fanout, rx)
}

pub fn watch_kind(kind: &str) -> WatchSpec {
    WatchSpec::new(format!("{}-watcher", kind)).with_kind(WatchKind::new(kind))
}

pub async fn recv(watcher: &mut Watcher<ResourceRecord>) -> Event<ResourceRecord> {
    timeout(WAIT, watcher.recv())
        .await
        .expect("event in time")
        .expect("watcher is alive")
}

pub async fn wait_removed(
    observer: &mut mpsc::Receiver<FanoutEvent>,
    watcher_id: u64,
) {
    timeout(WAIT, async {
        loop {
            match observer.recv().await {
                Some(FanoutEvent::WatcherRemoved { watcher_id: id }) if id == watcher_id => return,
                Some(_) => continue,
                None => panic!("observer closed"),
            }
        }
    })
    .await
    .expect("removal reported in time")
}
