use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use salvo::prelude::*;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

static SOURCE_EVENTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_RELAYED: AtomicU64 = AtomicU64::new(0);
static RELAY_FAILURES: AtomicU64 = AtomicU64::new(0);
static EDITS_APPLIED: AtomicU64 = AtomicU64::new(0);
static RECALLS_APPLIED: AtomicU64 = AtomicU64::new(0);
static MAPPINGS_PRUNED: AtomicU64 = AtomicU64::new(0);
static ACTIVE_LANES: AtomicU64 = AtomicU64::new(0);

/// Process-wide relay counters exposed on `/metrics`.
pub struct Metrics;

impl Metrics {
    /// Pins the uptime origin. Safe to call more than once.
    pub fn init() {
        Lazy::force(&STARTED_AT);
    }

    pub fn source_event_received() {
        SOURCE_EVENTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_relayed() {
        MESSAGES_RELAYED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_failed() {
        RELAY_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn edit_applied() {
        EDITS_APPLIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recall_applied() {
        RECALLS_APPLIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mappings_pruned(count: usize) {
        MAPPINGS_PRUNED.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn set_active_lanes(count: usize) {
        ACTIVE_LANES.store(count as u64, Ordering::Relaxed);
    }
}

pub fn format_prometheus() -> String {
    let series = [
        (
            "bridge_uptime_seconds",
            "gauge",
            "Number of seconds the bridge has been running",
            STARTED_AT.elapsed().as_secs(),
        ),
        (
            "source_events_received_total",
            "counter",
            "Message events received from monitored conversations",
            SOURCE_EVENTS_RECEIVED.load(Ordering::Relaxed),
        ),
        (
            "messages_relayed_total",
            "counter",
            "Messages copied to a destination",
            MESSAGES_RELAYED.load(Ordering::Relaxed),
        ),
        (
            "relay_failures_total",
            "counter",
            "Relay tasks that failed or panicked",
            RELAY_FAILURES.load(Ordering::Relaxed),
        ),
        (
            "edits_applied_total",
            "counter",
            "Edit annotations appended to relayed copies",
            EDITS_APPLIED.load(Ordering::Relaxed),
        ),
        (
            "recalls_applied_total",
            "counter",
            "Deletions mirrored as recall notices",
            RECALLS_APPLIED.load(Ordering::Relaxed),
        ),
        (
            "mappings_pruned_total",
            "counter",
            "Mapping entries removed by the retention sweep",
            MAPPINGS_PRUNED.load(Ordering::Relaxed),
        ),
        (
            "active_lanes",
            "gauge",
            "Destination lanes with a running worker",
            ACTIVE_LANES.load(Ordering::Relaxed),
        ),
    ];

    let mut output = String::new();
    for (name, kind, help, value) in series {
        output.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n\n"
        ));
    }
    output
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.render(Text::Plain(format_prometheus()));
}
