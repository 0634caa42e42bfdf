//! Metrics for observability.
//!
//! Emits through the `metrics` facade; the hosting process decides whether
//! and how to export them (Prometheus, StatsD, nothing).
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `bisync_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds
//!
//! Direction labels are `local_to_remote` / `remote_to_local`.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Sync Worker Metrics
// =============================================================================

/// Record a change event received from a source stream.
pub fn record_event_received(direction: &str, operation: &str) {
    counter!(
        "bisync_events_received_total",
        "direction" => direction.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record how an event was resolved (applied, skipped as echo, ...).
pub fn record_event_outcome(direction: &str, outcome: &str) {
    counter!(
        "bisync_events_applied_total",
        "direction" => direction.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an event that failed to apply.
pub fn record_apply_error(direction: &str, operation: &str) {
    counter!(
        "bisync_apply_errors_total",
        "direction" => direction.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record time spent applying one event to the target.
pub fn record_apply_latency(direction: &str, duration: Duration) {
    histogram!("bisync_apply_duration_seconds", "direction" => direction.to_string())
        .record(duration.as_secs_f64());
}

/// Record a change stream failure.
pub fn record_stream_error(direction: &str) {
    counter!("bisync_stream_errors_total", "direction" => direction.to_string()).increment(1);
}

/// Record a supervised stream reopen.
pub fn record_stream_restart(direction: &str) {
    counter!("bisync_stream_restarts_total", "direction" => direction.to_string()).increment(1);
}

/// Record a stored resume token the server no longer accepts (possible data gap).
pub fn record_resume_token_rejected(direction: &str) {
    counter!("bisync_resume_token_rejected_total", "direction" => direction.to_string())
        .increment(1);
}

/// Gauge for worker state (0=stopped, 1=starting, 2=running, 3=failed).
pub fn set_worker_state(direction: &str, state: &str) {
    let value = match state {
        "Stopped" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Failed" => 3.0,
        _ => -1.0,
    };
    gauge!("bisync_worker_state", "direction" => direction.to_string()).set(value);
}

/// Gauge for coordinator state.
pub fn set_coordinator_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Degraded" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        "Disabled" => 6.0,
        _ => -1.0,
    };
    gauge!("bisync_coordinator_state").set(value);
}

/// Gauge for pending origin-tracker entries.
pub fn set_origin_pending(count: usize) {
    gauge!("bisync_origin_pending").set(count as f64);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "bisync_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!("bisync_circuit_rejections_total", "circuit" => circuit_name.to_string())
        .increment(1);
}

// =============================================================================
// Reconciliation Metrics
// =============================================================================

/// Record a completed reconciliation pass for one direction.
pub fn record_reconcile_run(
    direction: &str,
    processed: u64,
    inserted: u64,
    skipped: u64,
    errors: u64,
    duration: Duration,
) {
    let direction = direction.to_string();

    counter!("bisync_reconcile_runs_total", "direction" => direction.clone()).increment(1);
    counter!("bisync_reconcile_processed_total", "direction" => direction.clone())
        .increment(processed);
    counter!("bisync_reconcile_inserted_total", "direction" => direction.clone())
        .increment(inserted);
    counter!("bisync_reconcile_skipped_total", "direction" => direction.clone())
        .increment(skipped);
    if errors > 0 {
        counter!("bisync_reconcile_errors_total", "direction" => direction.clone())
            .increment(errors);
    }
    histogram!("bisync_reconcile_duration_seconds", "direction" => direction)
        .record(duration.as_secs_f64());
}

// =============================================================================
// Preflight / Diagnostics
// =============================================================================

/// Record a preflight result.
pub fn record_preflight(status: &str, ok: bool) {
    counter!("bisync_preflight_total", "status" => status.to_string()).increment(1);
    gauge!("bisync_preflight_ok").set(if ok { 1.0 } else { 0.0 });
}

/// Record a round-trip diagnostic.
pub fn record_roundtrip(success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("bisync_roundtrip_total", "status" => status).increment(1);
    if success {
        histogram!("bisync_roundtrip_latency_seconds").record(latency.as_secs_f64());
    }
}

// =============================================================================
// Resume Token Store
// =============================================================================

/// Record resume-token flush batch (debounced writes).
pub fn record_resume_flush(flushed: usize, errors: usize) {
    counter!("bisync_resume_flushes_total").increment(1);
    counter!("bisync_resume_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("bisync_resume_flush_errors_total").increment(errors as u64);
    }
}

/// Record resume store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn resume_retries_total(operation: &str) {
    counter!("bisync_resume_retries_total", "operation" => operation.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed in unit tests; these calls must be no-ops
    // that never panic.

    #[test]
    fn test_worker_metrics() {
        record_event_received("local_to_remote", "insert");
        record_event_outcome("local_to_remote", "inserted");
        record_apply_error("remote_to_local", "delete");
        record_apply_latency("remote_to_local", Duration::from_millis(3));
        record_stream_error("local_to_remote");
        record_stream_restart("local_to_remote");
        record_resume_token_rejected("remote_to_local");
    }

    #[test]
    fn test_state_gauges_all_states() {
        for state in ["Stopped", "Starting", "Running", "Failed", "Unknown"] {
            set_worker_state("local_to_remote", state);
        }
        for state in [
            "Created", "Starting", "Running", "Degraded", "Stopped", "Failed", "Disabled", "?",
        ] {
            set_coordinator_state(state);
        }
        set_origin_pending(12);
    }

    #[test]
    fn test_reconcile_metrics() {
        record_reconcile_run("remote_to_local", 100, 100, 0, 0, Duration::from_secs(1));
        record_reconcile_run("local_to_remote", 10, 0, 9, 1, Duration::from_millis(5));
    }

    #[test]
    fn test_misc_metrics() {
        record_circuit_call("local_to_remote_writes", "success");
        record_circuit_rejection("local_to_remote_writes");
        record_preflight("ok", true);
        record_preflight("replication_disabled", false);
        record_roundtrip(true, Duration::from_millis(250));
        record_roundtrip(false, Duration::from_secs(5));
        record_resume_flush(2, 0);
        record_resume_flush(0, 1);
        resume_retries_total("resume_flush");
    }
}
