use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use fanwatch::Error;
use fanwatch::Event;
use fanwatch::OpType;
use fanwatch::ResourceRecord;
use fanwatch::WatchError;
use fanwatch::WatchKind;
use fanwatch::WatchSpec;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::common::new_fanout;
use crate::common::recv;
use crate::common::wait_removed;
use crate::common::watch_kind;
use crate::common::WAIT;

fn node(name: &str) -> ResourceRecord {
    ResourceRecord::new("node", name)
}

#[tokio::test]
async fn init_precedes_the_first_change() {
    let (fanout, _observer) = new_fanout();
    fanout.set_init();
    let mut w1 = fanout.new_watcher(watch_kind("node")).unwrap();

    fanout.emit(&[Event::put(node("n1"))]);

    assert_eq!(recv(&mut w1).await.op, OpType::Init);
    let put = recv(&mut w1).await;
    assert_eq!(put.op, OpType::Put);
    assert_eq!(put.resource.unwrap().metadata.name, "n1");
}

#[tokio::test]
async fn emit_before_init_panics_and_init_releases_the_watcher() {
    let (fanout, _observer) = new_fanout();
    let mut w1 = fanout.new_watcher(watch_kind("node").with_queue_size(1)).unwrap();

    let producer = fanout.clone();
    let emitted = thread::spawn(move || producer.emit(&[Event::put(node("n1"))])).join();
    assert!(emitted.is_err(), "emit before init must panic");

    fanout.set_init();
    assert_eq!(recv(&mut w1).await.op, OpType::Init);
}

#[tokio::test]
async fn slow_consumer_is_evicted() {
    let (fanout, mut observer) = new_fanout();
    fanout.set_init();
    let w1 = fanout.new_watcher(watch_kind("node").with_queue_size(1)).unwrap();

    fanout.emit(&[Event::put(node("n1"))]);
    fanout.emit(&[Event::put(node("n2"))]);

    wait_removed(&mut observer, w1.id()).await;
    assert_eq!(fanout.len(), 0);
    assert!(w1.error().is_some());
}

#[tokio::test]
async fn secrets_only_reach_privileged_watchers() {
    let (fanout, _observer) = new_fanout();
    fanout.set_init();
    let mut w1 = fanout.new_watcher(watch_kind("db")).unwrap();
    let mut w2 = fanout
        .new_watcher(WatchSpec::new("privileged").with_kind(WatchKind::new("db").with_load_secrets(true)))
        .unwrap();

    let record = ResourceRecord::new("db", "main").with_secrets(Bytes::from_static(b"s3cr3t"));
    fanout.emit(&[Event::put(record)]);

    recv(&mut w1).await;
    recv(&mut w2).await;
    assert_eq!(recv(&mut w1).await.resource.unwrap().secrets, None);
    assert_eq!(
        recv(&mut w2).await.resource.unwrap().secrets,
        Some(Bytes::from_static(b"s3cr3t"))
    );
}

#[tokio::test]
async fn late_watchers_get_init_before_changes() {
    let (fanout, _observer) = new_fanout();
    fanout.set_init();
    fanout.emit(&[Event::put(node("before"))]);

    let mut late = fanout.new_watcher(watch_kind("node")).unwrap();
    fanout.emit(&[Event::put(node("after"))]);

    assert_eq!(recv(&mut late).await.op, OpType::Init);
    let put = recv(&mut late).await;
    assert_eq!(put.resource.unwrap().metadata.name, "after");
}

#[tokio::test]
async fn broadcast_ignores_kind_filters() {
    let (fanout, _observer) = new_fanout();
    fanout.set_init();
    let mut nodes = fanout.new_watcher(watch_kind("node")).unwrap();
    let mut users = fanout
        .new_watcher(WatchSpec::new("alice-only").with_kind(WatchKind::new("user").with_name("alice")))
        .unwrap();

    fanout.emit(&[Event::broadcast(OpType::Put)]);

    for watcher in [&mut nodes, &mut users] {
        assert_eq!(recv(watcher).await.op, OpType::Init);
        assert!(recv(watcher).await.resource.is_none());
    }
}

#[tokio::test]
async fn registration_after_close_fails() {
    let (fanout, _observer) = new_fanout();
    fanout.set_init();
    fanout.close();

    assert!(matches!(fanout.new_watcher(watch_kind("node")), Err(Error::FanoutClosed)));
}

/// One producer thread, many consumers subscribing concurrently: everyone
/// that keeps up sees an unbroken, ordered stream after its Init.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_see_ordered_streams() {
    const EVENTS: usize = 500;
    const CONSUMERS: usize = 16;

    let (fanout, _observer) = new_fanout();
    fanout.set_init();

    let mut consumers = Vec::new();
    for _ in 0..CONSUMERS {
        let mut watcher = fanout
            .new_watcher(watch_kind("node").with_queue_size(EVENTS + 1))
            .unwrap();
        consumers.push(tokio::spawn(async move {
            assert_eq!(recv(&mut watcher).await.op, OpType::Init);
            let mut last = None;
            for _ in 0..EVENTS {
                let event = recv(&mut watcher).await;
                let seq: usize = event.resource.unwrap().metadata.name.parse().unwrap();
                if let Some(prev) = last {
                    assert_eq!(seq, prev + 1, "gap or reordering in the stream");
                }
                last = Some(seq);
            }
            assert!(watcher.error().is_none());
        }));
    }

    let producer = {
        let fanout = fanout.clone();
        thread::spawn(move || {
            for seq in 0..EVENTS {
                fanout.emit(&[Event::put(node(&seq.to_string()))]);
            }
        })
    };
    producer.join().unwrap();

    for consumer in consumers {
        timeout(WAIT, consumer).await.unwrap().unwrap();
    }
}

/// Registrations racing with the producer and with evictions never corrupt
/// the registry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registration_races_with_eviction() {
    let (fanout, _observer) = new_fanout();
    fanout.set_init();
    let fanout = Arc::new(fanout);

    let registrars: Vec<_> = (0..4)
        .map(|_| {
            let fanout = fanout.clone();
            thread::spawn(move || {
                let mut kept = Vec::new();
                for i in 0..50 {
                    // every other watcher is too small to survive a single event
                    let size = if i % 2 == 0 { 1 } else { 1024 };
                    kept.push(fanout.new_watcher(watch_kind("node").with_queue_size(size)).unwrap());
                }
                kept
            })
        })
        .collect();

    for seq in 0..100 {
        fanout.emit(&[Event::put(node(&seq.to_string()))]);
    }

    let watchers: Vec<_> = registrars.into_iter().flat_map(|r| r.join().unwrap()).collect();
    fanout.emit(&[Event::put(node("final"))]);

    for watcher in &watchers {
        let evicted = watcher.spec().queue_size == 1;
        if evicted {
            timeout(WAIT, watcher.done()).await.expect("small watcher evicted");
            assert_eq!(watcher.error(), Some(WatchError::BufferOverflow { capacity: 1 }));
        } else {
            assert!(watcher.error().is_none());
        }
    }

    timeout(WAIT, async {
        while fanout.len() != 100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("evicted watchers removed");
}

/// A consumer loop driven by `select!` over its queue and its done future
/// stops when the caller's token is cancelled.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_loop_stops_with_its_parent() {
    let (fanout, mut observer) = new_fanout();
    fanout.set_init();
    let parent = CancellationToken::new();
    let mut watcher = fanout.new_watcher_with_parent(&parent, watch_kind("node")).unwrap();
    let id = watcher.id();

    let consumer = tokio::spawn(async move {
        let done = watcher.done();
        tokio::pin!(done);
        let mut seen = Vec::new();
        loop {
            tokio::select! {
                _ = &mut done => break,
                Some(event) = watcher.events().recv() => seen.push(event.op),
            }
        }
        seen
    });

    fanout.emit(&[Event::put(node("n1"))]);
    parent.cancel();
    let seen = timeout(WAIT, consumer).await.unwrap().unwrap();
    assert!(seen.len() <= 2);

    fanout.emit(&[Event::put(node("n2"))]);
    wait_removed(&mut observer, id).await;
    assert!(fanout.is_empty());
}
