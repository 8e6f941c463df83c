//! Metrics definitions for the Presence Coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `pc_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `method`: signaling request methods (~11 values)
//! - `operation`: media engine operations (~9 values)
//! - `status`: `ok` / `error`
//! - `kind`: handle kinds (transport, producer, consumer) or delta kinds

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle used to
/// render `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Engine calls cross the network to the media server
        .set_buckets_for_metric(
            Matcher::Prefix("pc_engine_call".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set engine call buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `pc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("pc_connections_active").set(count as f64);
}

/// Metric: `pc_sessions_active` (registered connections)
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("pc_sessions_active").set(count as f64);
}

/// Metric: `pc_streaming_peers` (size of the latest presence snapshot)
pub fn set_streaming_peers(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("pc_streaming_peers").set(count as f64);
}

/// Metric: `pc_actor_mailbox_depth`
/// Labels: `actor_type` (coordinator, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("pc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Counters and histograms
// ============================================================================

/// Record a handled signaling request.
///
/// Metric: `pc_requests_total`
/// Labels: `method`, `status`
pub fn record_request(method: &str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    counter!(
        "pc_requests_total",
        "method" => method.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record one call into the media engine.
///
/// Metrics: `pc_engine_calls_total`, `pc_engine_call_duration_seconds`
/// Labels: `operation`, `status`
pub fn record_engine_call(operation: &str, ok: bool, duration: Duration) {
    let status = if ok { "ok" } else { "error" };
    counter!(
        "pc_engine_calls_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "pc_engine_call_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a handle that came back from the engine after its session was
/// gone and was closed instead of registered.
///
/// Metric: `pc_orphaned_handles_total`
/// Labels: `kind` (transport, producer, consumer)
pub fn record_orphaned_handle(kind: &str) {
    counter!("pc_orphaned_handles_total", "kind" => kind.to_string()).increment(1);
}

/// Metric: `pc_evictions_total`
pub fn record_eviction() {
    counter!("pc_evictions_total").increment(1);
}

/// Record a presence publication.
///
/// Metric: `pc_presence_broadcasts_total`
/// Labels: `kind` (snapshot, join, update, leave)
pub fn record_presence_broadcast(kind: &str) {
    counter!("pc_presence_broadcasts_total", "kind" => kind.to_string()).increment(1);
}

/// Record an outbound event dropped because a client mailbox was full or
/// closed.
///
/// Metric: `pc_events_dropped_total`
pub fn record_event_dropped() {
    counter!("pc_events_dropped_total").increment(1);
}

/// Record an actor panic.
///
/// Metric: `pc_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("pc_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run against the global no-op recorder; they only exercise the
    // recording paths.

    #[test]
    fn test_gauges() {
        set_connections_active(0);
        set_connections_active(250);
        set_sessions_active(10);
        set_streaming_peers(3);
        set_actor_mailbox_depth("coordinator", 12);
        set_actor_mailbox_depth("connection", 0);
    }

    #[test]
    fn test_counters_and_histograms() {
        record_request("register", true);
        record_request("produce", false);
        record_engine_call("create_transport", true, Duration::from_millis(12));
        record_engine_call("consume", false, Duration::from_millis(250));
        record_orphaned_handle("consumer");
        record_eviction();
        record_presence_broadcast("snapshot");
        record_presence_broadcast("leave");
        record_event_dropped();
        record_actor_panic("connection");
    }
}
