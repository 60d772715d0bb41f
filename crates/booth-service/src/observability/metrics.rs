//! Metrics definitions for the booth service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `booth_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `state`: 3 values (guest, authenticated, lost)
//! - `outcome`: bounded by advance results (~5 values)
//! - `operation`: bounded by store commands (~25 values)
//! - `channel`: 2 values (broadcast, action)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Advance holds a 2s lease; anything near that is a problem.
        .set_buckets_for_metric(
            Matcher::Full("booth_advance_duration_seconds".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.000, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set advance duration buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("booth_store_latency_seconds".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Set the number of local connections in a given state.
///
/// Metric: `booth_connections_active`
/// Labels: `state`
pub fn set_connections_active(state: &'static str, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("booth_connections_active", "state" => state).set(count as f64);
}

/// Record one advance attempt and how long it held the lease.
///
/// Metric: `booth_advance_total`, `booth_advance_duration_seconds`
/// Labels: `outcome` (playing, idle, in_progress, inconsistent, error)
pub fn record_advance(outcome: &'static str, duration: Duration) {
    counter!("booth_advance_total", "outcome" => outcome).increment(1);
    histogram!("booth_advance_duration_seconds").record(duration.as_secs_f64());
}

/// Record shared store operation latency.
///
/// Metric: `booth_store_latency_seconds`
/// Labels: `operation`
pub fn record_store_latency(operation: &'static str, duration: Duration) {
    histogram!("booth_store_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Count a message buffered for a lost participant.
///
/// Metric: `booth_lost_messages_buffered_total`
pub fn record_lost_message_buffered() {
    counter!("booth_lost_messages_buffered_total").increment(1);
}

/// Count a message received from the cross-process bus.
///
/// Metric: `booth_bus_messages_total`
/// Labels: `channel`
pub fn record_bus_message(channel: &'static str) {
    counter!("booth_bus_messages_total", "channel" => channel).increment(1);
}

/// Metric: `booth_waitlist_length`
pub fn set_waitlist_length(len: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("booth_waitlist_length").set(len as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Recording without an installed recorder is a no-op; these only
    // exercise the call paths.
    #[test]
    fn test_recording_without_recorder_is_harmless() {
        set_connections_active("guest", 3);
        record_advance("playing", Duration::from_millis(12));
        record_store_latency("list_range", Duration::from_micros(300));
        record_lost_message_buffered();
        record_bus_message("action");
        set_waitlist_length(7);
    }

    #[test]
    fn test_advance_counter_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_advance("idle", Duration::from_millis(4));
            record_advance("idle", Duration::from_millis(6));
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let idle_count = snapshot.iter().find_map(|(key, _, _, value)| {
            let is_idle = key.key().name() == "booth_advance_total"
                && key.key().labels().any(|l| l.value() == "idle");
            match (is_idle, value) {
                (true, DebugValue::Counter(n)) => Some(*n),
                _ => None,
            }
        });
        assert_eq!(idle_count, Some(2));
    }
}
