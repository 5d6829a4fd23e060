//! Operational counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Gauges (live connections, calls, pending acks) are read from the owning maps.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Connections registered after a successful handshake.
    pub connections_total: AtomicU64,
    /// Handshakes refused (bad credential, capacity, rate limit).
    pub auth_failures_total: AtomicU64,
    /// Inbound events accepted for dispatch.
    pub events_in_total: AtomicU64,
    /// Frames handed to connection writers.
    pub events_out_total: AtomicU64,
    /// Frames dropped because a connection was full or gone.
    pub deliveries_dropped_total: AtomicU64,
    /// At-least-once emissions started.
    pub acks_emitted_total: AtomicU64,
    /// Receipts that cleared a pending emission.
    pub acks_acknowledged_total: AtomicU64,
    /// Re-emissions after a missed deadline.
    pub acks_retried_total: AtomicU64,
    /// Emissions handed to the delivery-failure sink.
    pub acks_exhausted_total: AtomicU64,
    /// Calls created.
    pub calls_started_total: AtomicU64,
    /// Calls removed from the live set.
    pub calls_ended_total: AtomicU64,
    /// Rate limit rejections (handshake + event + global).
    pub rate_limit_hits: AtomicU64,
    /// Inbound events dropped as malformed or unauthorized.
    pub protocol_errors_total: AtomicU64,
}

impl RelayMetrics {
    /// Increment a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
