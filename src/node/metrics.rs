//! Minimal metrics emission helpers.
//!
//! Counters are emitted as structured tracing events by default. A test
//! sink can be installed to capture emissions in unit tests.

use std::sync::{Arc, OnceLock, RwLock};

pub trait MetricSink: Send + Sync {
    fn incr(&self, name: &'static str, label: Option<&str>);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn incr(&self, name: &'static str, label: Option<&str>) {
        match label {
            Some(label) => tracing::debug!(target: "metrics", metric = name, label),
            None => tracing::debug!(target: "metrics", metric = name),
        }
    }
}

static METRIC_SINK: OnceLock<RwLock<Arc<dyn MetricSink>>> = OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

/// A frame was dropped; `reason` is one of `stale_term`, `duplicate`,
/// `gap_stale`, `buffer_overflow`, `no_leader`.
pub fn dropped(reason: &'static str) {
    sink().incr("messages_dropped", Some(reason));
}

pub fn send_failed() {
    sink().incr("peer_send_failed", None);
}

pub fn election_started() {
    sink().incr("elections_started", None);
}
