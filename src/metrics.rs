//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Task intake (pulled, skipped, parked)
//! - Reconciliation outcomes and task state transitions
//! - Retries, backfills and execution-state rebuilds
//! - DLQ activity and the DLQ alarm
//! - Worker queue depth and source ack levels
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use history_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_tasks_pulled("cluster-b", 42);
//! metrics::record_task_applied("cluster-b", Duration::from_millis(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Task Intake
// =============================================================================

/// Record tasks pulled from a source cluster.
pub fn record_tasks_pulled(source_cluster: &str, count: usize) {
    counter!("replication_tasks_pulled_total", "source_cluster" => source_cluster.to_string())
        .increment(count as u64);
}

/// Record a pull round trip.
pub fn record_pull_latency(source_cluster: &str, duration: Duration) {
    histogram!("replication_pull_duration_seconds", "source_cluster" => source_cluster.to_string())
        .record(duration.as_secs_f64());
}

/// Record a task skipped without applying (`below_watermark`, `dlq_resolved`).
pub fn record_task_skipped(source_cluster: &str, reason: &str) {
    counter!(
        "replication_tasks_skipped_total",
        "source_cluster" => source_cluster.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Number of tasks held back behind blocked runs.
pub fn set_parked_tasks(source_cluster: &str, count: usize) {
    gauge!("replication_parked_tasks", "source_cluster" => source_cluster.to_string())
        .set(count as f64);
}

/// Highest task ID below which every task of a source is finished.
pub fn set_ack_level(source_cluster: &str, task_id: i64) {
    gauge!("replication_ack_level", "source_cluster" => source_cluster.to_string())
        .set(task_id as f64);
}

/// Tasks waiting in a worker shard's queue.
pub fn set_queue_depth(shard: usize, depth: usize) {
    gauge!("replication_worker_queue_depth", "shard" => shard.to_string()).set(depth as f64);
}

/// Record a puller backing off because a worker queue was full.
pub fn record_backpressure(source_cluster: &str) {
    counter!("replication_backpressure_total", "source_cluster" => source_cluster.to_string())
        .increment(1);
}

// =============================================================================
// Task Processing
// =============================================================================

/// Record a reconciliation outcome (`create`, `duplicate`, `extend`, ...).
pub fn record_classification(outcome: &str) {
    counter!("replication_reconciliations_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a task state transition.
pub fn record_task_state(source_cluster: &str, state: &str) {
    counter!(
        "replication_task_transitions_total",
        "source_cluster" => source_cluster.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record a task applied, with the time from first attempt to commit.
pub fn record_task_applied(source_cluster: &str, duration: Duration) {
    counter!("replication_tasks_applied_total", "source_cluster" => source_cluster.to_string())
        .increment(1);
    histogram!("replication_apply_duration_seconds", "source_cluster" => source_cluster.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retry scheduled after a retryable failure.
pub fn record_retry(source_cluster: &str, error_kind: &str) {
    counter!(
        "replication_task_retries_total",
        "source_cluster" => source_cluster.to_string(),
        "error_type" => error_kind.to_string()
    )
    .increment(1);
}

/// Record a backfill fetch.
pub fn record_backfill(source_cluster: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_backfills_total",
        "source_cluster" => source_cluster.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record an execution-state rebuild after the current branch moved.
pub fn record_rebuild(replayed_events: usize) {
    counter!("replication_rebuilds_total").increment(1);
    histogram!("replication_rebuild_events").record(replayed_events as f64);
}

/// Record errors by type.
pub fn record_error(source_cluster: &str, error_type: &str) {
    counter!(
        "replication_errors_total",
        "source_cluster" => source_cluster.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// DLQ
// =============================================================================

/// Record a task written to the DLQ.
pub fn record_dlq_put(source_cluster: &str, error_type: &str) {
    counter!(
        "replication_dlq_entries_total",
        "source_cluster" => source_cluster.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record DLQ entries removed (merge or purge).
pub fn record_dlq_delete(source_cluster: &str, count: usize) {
    counter!("replication_dlq_deletes_total", "source_cluster" => source_cluster.to_string())
        .increment(count as u64);
}

/// Record a merge (re-drive) pass.
pub fn record_dlq_merge(source_cluster: &str, applied: usize, unresolved: usize) {
    counter!("replication_dlq_merges_total", "source_cluster" => source_cluster.to_string())
        .increment(1);
    counter!("replication_dlq_merge_applied_total", "source_cluster" => source_cluster.to_string())
        .increment(applied as u64);
    counter!("replication_dlq_merge_unresolved_total", "source_cluster" => source_cluster.to_string())
        .increment(unresolved as u64);
}

/// Number of runs of a source blocked behind DLQ entries. Non-zero means
/// replication for those runs has stopped and needs an operator.
pub fn set_dlq_alarm(source_cluster: &str, blocked_runs: usize) {
    gauge!("replication_dlq_alarm", "source_cluster" => source_cluster.to_string())
        .set(blocked_runs as f64);
}

// =============================================================================
// SQLite Stores
// =============================================================================

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("replication_cursor_flushes_total").increment(1);
    counter!("replication_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("replication_cursor_flush_errors_total").increment(errors as u64);
    }
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn sqlite_retries_total(store: &str, operation: &str) {
    counter!(
        "replication_sqlite_retries_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// =============================================================================
// Engine & Circuit Breaker
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

// =============================================================================
// SLO Metrics
// =============================================================================

/// Record an SLO violation (latency threshold exceeded).
pub fn record_slo_violation(source_cluster: &str, slo_type: &str, latency_ms: u64) {
    counter!(
        "replication_slo_violations_total",
        "source_cluster" => source_cluster.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .increment(1);

    histogram!(
        "replication_slo_violation_latency_ms",
        "source_cluster" => source_cluster.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .record(latency_ms as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state with a no-op recorder by default, so
    // these only check that recording never panics.

    #[test]
    fn test_task_metrics() {
        record_tasks_pulled("cluster-b", 10);
        record_tasks_pulled("cluster-b", 0);
        record_pull_latency("cluster-b", Duration::from_millis(3));
        record_task_skipped("cluster-b", "below_watermark");
        record_classification("fork");
        record_task_state("cluster-b", "applied");
        record_task_applied("cluster-b", Duration::ZERO);
        record_retry("cluster-b", "transient_storage");
        record_backfill("cluster-b", true);
        record_rebuild(0);
        record_error("", "internal");
    }

    #[test]
    fn test_dlq_metrics() {
        record_dlq_put("cluster-b", "unresolvable");
        record_dlq_delete("cluster-b", 3);
        record_dlq_merge("cluster-b", 2, 1);
        set_dlq_alarm("cluster-b", 0);
    }

    #[test]
    fn test_gauges() {
        set_parked_tasks("cluster-b", 4);
        set_ack_level("cluster-b", -1);
        set_queue_depth(0, 12);
        record_backpressure("cluster-b");
        record_cursor_flush(5, 1);
        sqlite_retries_total("dlq", "put");
    }

    #[test]
    fn test_engine_state_values() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "?"] {
            set_engine_state(state);
        }
        set_circuit_state("history_writes", "open");
        record_circuit_call("history_writes", "rejected");
        record_slo_violation("cluster-b", "task_apply", 1500);
    }
}
