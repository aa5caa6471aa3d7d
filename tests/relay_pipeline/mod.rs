use std::sync::Arc;

use fanwatch::BackoffPolicy;
use fanwatch::MemoryBackend;
use fanwatch::OpType;
use fanwatch::RecordCodec;
use fanwatch::Relay;
use fanwatch::RelayConfig;
use fanwatch::ResourceRecord;
use fanwatch::WatchKind;
use fanwatch::WatchSpec;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::common::new_fanout;
use crate::common::recv;
use crate::common::watch_kind;
use crate::common::WAIT;

fn config() -> RelayConfig {
    RelayConfig {
        prefixes: vec!["/node/".to_string(), "/db/".to_string()],
        backoff: BackoffPolicy {
            max_retries: 0,
            base_delay_ms: 5,
            max_delay_ms: 50,
        },
        ..RelayConfig::default()
    }
}

fn store(
    backend: &MemoryBackend,
    record: &ResourceRecord,
) {
    backend.put(RecordCodec::encode(record).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_changes_reach_filtered_watchers() {
    let backend = MemoryBackend::new();
    let (fanout, _observer) = new_fanout();
    let mut all_nodes = fanout.new_watcher(watch_kind("node")).unwrap();
    let mut prod_nodes = fanout
        .new_watcher(WatchSpec::new("prod").with_kind(WatchKind::new("node").with_filter("env", "prod")))
        .unwrap();
    let mut dbs = fanout.new_watcher(watch_kind("db")).unwrap();

    let relay = Relay::new(backend.clone(), fanout.clone(), RecordCodec, config()).unwrap();
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { relay.run(shutdown).await })
    };

    for watcher in [&mut all_nodes, &mut prod_nodes, &mut dbs] {
        assert_eq!(recv(watcher).await.op, OpType::Init);
    }

    store(&backend, &ResourceRecord::new("node", "dev-1").with_label("env", "dev"));
    store(&backend, &ResourceRecord::new("node", "prod-1").with_label("env", "prod"));
    store(&backend, &ResourceRecord::new("user", "alice"));
    store(&backend, &ResourceRecord::new("db", "main"));

    assert_eq!(recv(&mut all_nodes).await.resource.unwrap().metadata.name, "dev-1");
    assert_eq!(recv(&mut all_nodes).await.resource.unwrap().metadata.name, "prod-1");
    assert_eq!(recv(&mut prod_nodes).await.resource.unwrap().metadata.name, "prod-1");
    assert_eq!(recv(&mut dbs).await.resource.unwrap().metadata.name, "main");

    // outside the relay prefixes
    assert!(dbs.try_recv().is_err());

    shutdown.cancel();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert!(fanout.is_closed());
    assert!(all_nodes.is_done());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchers_resubscribe_after_feed_loss() {
    let backend = MemoryBackend::new();
    let (fanout, _observer) = new_fanout();
    let relay = Arc::new(Relay::new(backend.clone(), fanout.clone(), RecordCodec, config()).unwrap());
    let shutdown = CancellationToken::new();
    {
        let relay = relay.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { relay.run(shutdown).await });
    }

    for round in 0..3 {
        let mut watcher = fanout.new_watcher(watch_kind("node")).unwrap();
        assert_eq!(recv(&mut watcher).await.op, OpType::Init);

        let name = format!("n{}", round);
        store(&backend, &ResourceRecord::new("node", &name));
        let put = recv(&mut watcher).await;
        assert_eq!(put.resource.unwrap().metadata.name, name);

        backend.close_watchers();
        timeout(WAIT, watcher.done()).await.expect("reset reaches the watcher");
        assert!(watcher.recv().await.is_none());
    }

    shutdown.cancel();
}
