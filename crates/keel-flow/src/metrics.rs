//! Observability metrics for the apply engine.
//!
//! Metrics are emitted through the `metrics` crate facade; install any
//! recorder (Prometheus, statsd) in the embedding binary to export them.
//! Without a recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `keel_flow_node_transitions_total` | Counter | `from_state`, `to_state` | Node status transitions |
//! | `keel_flow_node_duration_seconds` | Histogram | `kind`, `result` | Time from dispatch to completion |
//! | `keel_flow_provider_calls_total` | Counter | `operation`, `result` | Provider and vault calls |
//! | `keel_flow_retries_total` | Counter | `operation` | Retried provider calls |
//! | `keel_flow_gate_polls_total` | Counter | `result` | Confirmation polls |
//! | `keel_flow_nodes_in_flight` | Gauge | - | Node operations currently running |
//! | `keel_flow_apply_duration_seconds` | Histogram | `operation`, `result` | Whole apply/destroy duration |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keel_flow::metrics::FlowMetrics;
//!
//! let metrics = FlowMetrics::new();
//! metrics.record_node_transition("pending", "applying");
//! metrics.record_provider_call("create", "success");
//! metrics.set_in_flight(3);
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Total node status transitions.
    pub const NODE_TRANSITIONS_TOTAL: &str = "keel_flow_node_transitions_total";
    /// Histogram: Node operation duration in seconds.
    pub const NODE_DURATION_SECONDS: &str = "keel_flow_node_duration_seconds";
    /// Counter: Total provider calls.
    pub const PROVIDER_CALLS_TOTAL: &str = "keel_flow_provider_calls_total";
    /// Counter: Total retried provider calls.
    pub const RETRIES_TOTAL: &str = "keel_flow_retries_total";
    /// Counter: Total confirmation polls.
    pub const GATE_POLLS_TOTAL: &str = "keel_flow_gate_polls_total";
    /// Gauge: Node operations in flight.
    pub const NODES_IN_FLIGHT: &str = "keel_flow_nodes_in_flight";
    /// Histogram: Apply or destroy duration in seconds.
    pub const APPLY_DURATION_SECONDS: &str = "keel_flow_apply_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous node status (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target node status (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Resource kind.
    pub const KIND: &str = "kind";
    /// Operation name (create, update, delete, poll, apply, destroy).
    pub const OPERATION: &str = "operation";
    /// Result (success, retryable, permanent, applied, failed).
    pub const RESULT: &str = "result";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a node status transition.
    pub fn record_node_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::NODE_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records how long a node operation took.
    pub fn observe_node_duration(&self, kind: &str, result: &str, duration: Duration) {
        histogram!(
            names::NODE_DURATION_SECONDS,
            labels::KIND => kind.to_string(),
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a provider or vault call.
    pub fn record_provider_call(&self, operation: &str, result: &str) {
        counter!(
            names::PROVIDER_CALLS_TOTAL,
            labels::OPERATION => operation.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a retried provider call.
    pub fn record_retry(&self, operation: &str) {
        counter!(
            names::RETRIES_TOTAL,
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Records a confirmation poll.
    pub fn record_gate_poll(&self, result: &str) {
        counter!(
            names::GATE_POLLS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Sets the number of node operations in flight.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_in_flight(&self, count: usize) {
        gauge!(names::NODES_IN_FLIGHT).set(count as f64);
    }

    /// Records a whole apply or destroy duration.
    pub fn observe_apply_duration(&self, operation: &str, result: &str, duration: Duration) {
        histogram!(
            names::APPLY_DURATION_SECONDS,
            labels::OPERATION => operation.to_string(),
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}

/// RAII guard for timing operations.
///
/// Calls `on_drop` with the elapsed duration when dropped, unless
/// [`TimingGuard::finish`] consumed it first.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Records now and returns the elapsed duration.
    pub fn finish(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_metrics_record_without_recorder() {
        let metrics = FlowMetrics::new();
        metrics.record_node_transition("pending", "applying");
        metrics.record_provider_call("create", "success");
        metrics.record_retry("update");
        metrics.record_gate_poll("pending");
        metrics.set_in_flight(2);
        metrics.observe_node_duration("dns_record", "applied", Duration::from_millis(5));
        metrics.observe_apply_duration("apply", "success", Duration::from_secs(1));
    }

    #[test]
    fn timing_guard_records_once() {
        let mut calls = 0;
        {
            let guard = TimingGuard::new(|_| calls += 1);
            std::thread::sleep(Duration::from_millis(2));
            assert!(guard.finish() >= Duration::from_millis(2));
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn timing_guard_records_on_drop() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
        }
        assert!(recorded.is_some());
    }
}
