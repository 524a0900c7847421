//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade:
//! - Change throughput per upstream and action
//! - Feedback frames sent/deduplicated
//! - Highest received stream position
//! - Worker lifecycle state
//!
//! All metrics are prefixed with `apply_`; counters end in `_total`.

use metrics::{counter, gauge};

/// Record a successful negotiation (origin resolved, stream started).
pub fn record_negotiated(upstream: &str) {
    counter!("apply_negotiations_total", "upstream" => upstream.to_string()).increment(1);
}

/// Record the worker's lifecycle state.
pub fn set_worker_state(upstream: &str, state: &str) {
    gauge!("apply_worker_state", "upstream" => upstream.to_string(), "state" => state.to_string())
        .set(1.0);
}

/// Record a change message received off the stream.
pub fn record_change_received(upstream: &str, action: &'static str) {
    counter!(
        "apply_changes_received_total",
        "upstream" => upstream.to_string(),
        "action" => action
    )
    .increment(1);
}

/// Record a change successfully handed to the apply layer.
pub fn record_change_applied(upstream: &str, action: &'static str) {
    counter!(
        "apply_changes_applied_total",
        "upstream" => upstream.to_string(),
        "action" => action
    )
    .increment(1);
}

/// Record a feedback frame sent upstream.
pub fn record_feedback_sent(upstream: &str) {
    counter!("apply_feedback_sent_total", "upstream" => upstream.to_string()).increment(1);
}

/// Record a feedback report skipped because the position was unchanged.
pub fn record_feedback_deduped(upstream: &str) {
    counter!("apply_feedback_deduped_total", "upstream" => upstream.to_string()).increment(1);
}

/// Record the highest stream position received this session.
pub fn set_last_received(upstream: &str, position: u64) {
    gauge!("apply_last_received_position", "upstream" => upstream.to_string())
        .set(position as f64);
}
