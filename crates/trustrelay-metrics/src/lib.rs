//! Metrics and tracing facade for trustrelay.
//!
//! The helpers here emit both metrics (via the `metrics` crate) and
//! lightweight tracing events. They are safe to call without a recorder
//! installed, so library crates use them unconditionally.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tracing::trace;

/// Count an admitted and persisted event.
pub fn record_event_admitted(kind: u16) {
    let labels = [("kind", kind.to_string())];
    counter!("trustrelay.admission.admitted_total", &labels).increment(1);
    trace!(kind, "event admitted");
}

/// Count a rejection by its machine-readable reason code.
pub fn record_event_rejected(reason: &'static str) {
    let labels = [("reason", reason)];
    counter!("trustrelay.admission.rejected_total", &labels).increment(1);
    trace!(reason, "event rejected");
}

/// Count a rank cache hit.
pub fn record_rank_cache_hit() {
    counter!("trustrelay.rank.cache_hits_total").increment(1);
}

/// Count a rank cache miss.
pub fn record_rank_cache_miss() {
    counter!("trustrelay.rank.cache_misses_total").increment(1);
}

/// Track the number of entries held by the rank cache.
pub fn record_rank_cache_size(entries: usize) {
    gauge!("trustrelay.rank.cache_entries").set(entries as f64);
}

/// Record the size of a refresh batch sent to the oracle.
pub fn record_refresh_batch(len: usize) {
    histogram!("trustrelay.rank.refresh_batch_size").record(len as f64);
    trace!(len, "refresh batch flushed");
}

/// Record an oracle round-trip outcome with its latency.
pub fn record_oracle_round_trip(ok: bool, latency: Duration) {
    let outcome = if ok { "ok" } else { "error" };
    let labels = [("outcome", outcome)];
    counter!("trustrelay.oracle.round_trips_total", &labels).increment(1);
    histogram!("trustrelay.oracle.round_trip_ms", &labels)
        .record(latency.as_secs_f64() * 1_000.0);
    trace!(outcome, latency_ms = latency.as_secs_f64() * 1_000.0, "oracle round trip");
}

/// Count buckets removed by a limiter cleanup pass; set to 0 when idle.
pub fn record_bucket_evictions(evicted: usize) {
    if evicted == 0 {
        return;
    }
    counter!("trustrelay.limiter.evictions_total").increment(evicted as u64);
    trace!(evicted, "limiter buckets evicted");
}

/// Track the number of live buckets in the limiter.
pub fn record_bucket_count(buckets: usize) {
    gauge!("trustrelay.limiter.buckets").set(buckets as f64);
}

/// Count rank-refresh enqueues dropped because the queue was full.
pub fn record_refresh_enqueue_dropped() {
    counter!("trustrelay.rank.enqueue_dropped_total").increment(1);
}
