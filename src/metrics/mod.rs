//! Prometheus collectors for the fanout and the relay.
//!
//! Everything is registered on the crate-local [`REGISTRY`]; embedders expose
//! it through their own endpoint with [`gather`].


use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::error;

lazy_static! {
    pub static ref WATCHERS_REGISTERED: IntCounter = IntCounter::new(
        "fanwatch_watchers_registered_total",
        "Watchers successfully attached to a fanout"
    )
    .expect("metric can not be created");

    pub static ref WATCHER_EVICTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "fanwatch_watcher_evictions_total",
            "Watchers torn down by the fanout, by reason"
        ),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref EVENTS_EMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("fanwatch_events_emitted_total", "Events emitted, by resource kind"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref RELAY_RESTARTS: IntCounter = IntCounter::new(
        "fanwatch_relay_restarts_total",
        "Times the relay reset the fanout and reopened the change feed"
    )
    .expect("metric can not be created");

    pub static ref RELAY_DECODE_FAILURES: IntCounter = IntCounter::new(
        "fanwatch_relay_decode_failures_total",
        "Backend events the relay could not decode"
    )
    .expect("metric can not be created");

    pub static ref RELAY_CONNECTED: IntGauge = IntGauge::new(
        "fanwatch_relay_connected",
        "1 while the relay has a live change feed"
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

fn register_custom_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(WATCHERS_REGISTERED.clone()),
            Box::new(WATCHER_EVICTIONS.clone()),
            Box::new(EVENTS_EMITTED.clone()),
            Box::new(RELAY_RESTARTS.clone()),
            Box::new(RELAY_DECODE_FAILURES.clone()),
            Box::new(RELAY_CONNECTED.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                error!("collector can not be registered: {}", e);
            }
        }
    });
}

/// Renders every collector in the Prometheus text format
pub fn gather() -> String {
    register_custom_metrics();

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!("custom metrics could not be from_utf8'd: {}", e);
        String::new()
    })
}
