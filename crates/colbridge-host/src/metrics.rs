//! Bridge counters and tracing hooks.
//!
//! Plain atomics, process-wide. Wire them to a real exporter in the binary
//! layer if needed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct BridgeMetrics {
    handles_created: AtomicU64,
    handles_disposed: AtomicU64,
    handles_consumed: AtomicU64,
    handles_cloned: AtomicU64,
    scan_passes: AtomicU64,
    batches_pushed: AtomicU64,
    batches_pulled: AtomicU64,
}

static GLOBAL: BridgeMetrics = BridgeMetrics {
    handles_created: AtomicU64::new(0),
    handles_disposed: AtomicU64::new(0),
    handles_consumed: AtomicU64::new(0),
    handles_cloned: AtomicU64::new(0),
    scan_passes: AtomicU64::new(0),
    batches_pushed: AtomicU64::new(0),
    batches_pulled: AtomicU64::new(0),
};

pub fn global() -> &'static BridgeMetrics {
    &GLOBAL
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub handles_created: u64,
    pub handles_disposed: u64,
    pub handles_consumed: u64,
    pub handles_cloned: u64,
    pub scan_passes: u64,
    pub batches_pushed: u64,
    pub batches_pulled: u64,
}

impl BridgeMetrics {
    pub(crate) fn record_create(&self) {
        self.handles_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispose(&self) {
        self.handles_disposed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_consume(&self) {
        self.handles_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clone(&self) {
        self.handles_cloned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pass(&self) {
        self.scan_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_push(&self) {
        self.batches_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pull(&self) {
        self.batches_pulled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_disposed: self.handles_disposed.load(Ordering::Relaxed),
            handles_consumed: self.handles_consumed.load(Ordering::Relaxed),
            handles_cloned: self.handles_cloned.load(Ordering::Relaxed),
            scan_passes: self.scan_passes.load(Ordering::Relaxed),
            batches_pushed: self.batches_pushed.load(Ordering::Relaxed),
            batches_pulled: self.batches_pulled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(feature = "tracing")]
pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "colbridge", event);
    let _enter = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn emit_span(_event: &str, _key_values: &[(&str, String)]) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_records() {
        let m = BridgeMetrics::default();
        m.record_create();
        m.record_create();
        m.record_pull();
        let s = m.snapshot();
        assert_eq!(s.handles_created, 2);
        assert_eq!(s.batches_pulled, 1);
        assert_eq!(s.handles_disposed, 0);
    }
}
