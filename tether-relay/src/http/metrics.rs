//! Prometheus metrics endpoint.

use crate::metrics::RelayMetrics;
use crate::server::Relay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(relay): Extension<Arc<Relay>>) -> impl IntoResponse {
    let body = render(&relay).await;
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn render(relay: &Relay) -> String {
    let m = relay.metrics();
    let get = RelayMetrics::get;

    // Gauges
    let connections = relay.registry().len();
    let groups = relay.registry().group_count();
    let calls = relay.calls().active_count();
    let pending_acks = relay.acks().pending_count();
    let limiter_keys = relay.rate_limits().event_keys_count();

    // Store gauges (best effort)
    let (undelivered, call_history) = match relay.store() {
        Some(store) => (
            store.undelivered_count().await.unwrap_or(0),
            store.call_count().await.unwrap_or(0),
        ),
        None => (0, 0),
    };

    format!(
        r#"# HELP tether_relay_connections_active Number of live connections
# TYPE tether_relay_connections_active gauge
tether_relay_connections_active {connections}

# HELP tether_relay_groups_active Number of non-empty groups
# TYPE tether_relay_groups_active gauge
tether_relay_groups_active {groups}

# HELP tether_relay_calls_active Number of live calls
# TYPE tether_relay_calls_active gauge
tether_relay_calls_active {calls}

# HELP tether_relay_acks_pending Emissions awaiting acknowledgment
# TYPE tether_relay_acks_pending gauge
tether_relay_acks_pending {pending_acks}

# HELP tether_relay_rate_limiter_keys Connections tracked by the event limiter
# TYPE tether_relay_rate_limiter_keys gauge
tether_relay_rate_limiter_keys {limiter_keys}

# HELP tether_relay_info Server information
# TYPE tether_relay_info gauge
tether_relay_info{{version="{version}"}} 1

# HELP tether_relay_connections_total Total connections registered
# TYPE tether_relay_connections_total counter
tether_relay_connections_total {connections_total}

# HELP tether_relay_auth_failures_total Total handshakes refused
# TYPE tether_relay_auth_failures_total counter
tether_relay_auth_failures_total {auth_failures}

# HELP tether_relay_events_in_total Total inbound events accepted
# TYPE tether_relay_events_in_total counter
tether_relay_events_in_total {events_in}

# HELP tether_relay_events_out_total Total frames queued to connections
# TYPE tether_relay_events_out_total counter
tether_relay_events_out_total {events_out}

# HELP tether_relay_deliveries_dropped_total Total frames dropped on full or closed connections
# TYPE tether_relay_deliveries_dropped_total counter
tether_relay_deliveries_dropped_total {dropped}

# HELP tether_relay_acks_emitted_total Total at-least-once emissions
# TYPE tether_relay_acks_emitted_total counter
tether_relay_acks_emitted_total {acks_emitted}

# HELP tether_relay_acks_acknowledged_total Total emissions acknowledged
# TYPE tether_relay_acks_acknowledged_total counter
tether_relay_acks_acknowledged_total {acks_acknowledged}

# HELP tether_relay_acks_retried_total Total re-emissions
# TYPE tether_relay_acks_retried_total counter
tether_relay_acks_retried_total {acks_retried}

# HELP tether_relay_acks_exhausted_total Total emissions handed to the failure sink
# TYPE tether_relay_acks_exhausted_total counter
tether_relay_acks_exhausted_total {acks_exhausted}

# HELP tether_relay_calls_started_total Total calls created
# TYPE tether_relay_calls_started_total counter
tether_relay_calls_started_total {calls_started}

# HELP tether_relay_calls_ended_total Total calls ended
# TYPE tether_relay_calls_ended_total counter
tether_relay_calls_ended_total {calls_ended}

# HELP tether_relay_rate_limit_hits_total Total rate limit rejections
# TYPE tether_relay_rate_limit_hits_total counter
tether_relay_rate_limit_hits_total {rate_limits}

# HELP tether_relay_protocol_errors_total Total inbound events dropped as invalid
# TYPE tether_relay_protocol_errors_total counter
tether_relay_protocol_errors_total {protocol_errors}

# HELP tether_relay_storage_undelivered Undelivered events awaiting replay
# TYPE tether_relay_storage_undelivered gauge
tether_relay_storage_undelivered {undelivered}

# HELP tether_relay_storage_calls Calls in history
# TYPE tether_relay_storage_calls gauge
tether_relay_storage_calls {call_history}
"#,
        version = env!("CARGO_PKG_VERSION"),
        connections_total = get(&m.connections_total),
        auth_failures = get(&m.auth_failures_total),
        events_in = get(&m.events_in_total),
        events_out = get(&m.events_out_total),
        dropped = get(&m.deliveries_dropped_total),
        acks_emitted = get(&m.acks_emitted_total),
        acks_acknowledged = get(&m.acks_acknowledged_total),
        acks_retried = get(&m.acks_retried_total),
        acks_exhausted = get(&m.acks_exhausted_total),
        calls_started = get(&m.calls_started_total),
        calls_ended = get(&m.calls_ended_total),
        rate_limits = get(&m.rate_limit_hits),
        protocol_errors = get(&m.protocol_errors_total),
    )
}
