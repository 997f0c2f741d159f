//! Metrics instrumentation.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! process chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `hashtree_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use std::time::Duration;

use metrics::{counter, histogram};

/// Record a segment-data update ("put" or "remove").
pub fn record_update(op: &'static str) {
    counter!("hashtree_updates_total", "op" => op).increment(1);
}

/// Record a deferred update that failed in the background worker.
pub fn record_deferred_failure() {
    counter!("hashtree_deferred_failures_total").increment(1);
}

/// Record a completed rebuild.
pub fn record_rebuild(full: bool, dirty_segments: usize, duration: Duration) {
    let kind = if full { "full" } else { "dirty" };
    counter!("hashtree_rebuilds_total", "kind" => kind).increment(1);
    histogram!("hashtree_rebuild_seconds", "kind" => kind).record(duration.as_secs_f64());
    histogram!("hashtree_rebuild_dirty_segments").record(dirty_segments as f64);
}

/// Record a completed reconciliation pass.
pub fn record_sync(key_differences: u64, extrinsic_segments: u64, duration: Duration) {
    counter!("hashtree_syncs_total").increment(1);
    counter!("hashtree_sync_key_differences_total").increment(key_differences);
    counter!("hashtree_sync_extrinsic_segments_total").increment(extrinsic_segments);
    histogram!("hashtree_sync_seconds").record(duration.as_secs_f64());
}
