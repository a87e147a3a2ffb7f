//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Operation log tailing (entries read, skipped, restarts, liveness)
//! - Push jobs per cluster and repository type
//! - Task registry SQLite retries
//! - Edge cache synchronization and eviction
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `artifact_replication_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed here; the embedding process picks an exporter.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("artifact_replication_engine_state").set(value);
}

// =============================================================================
// Tailer Metrics
// =============================================================================

/// Gauge for tailer state (0=stopped, 1=starting, 2=running, 3=failed).
pub fn set_tailer_state(state: &str) {
    let value = match state {
        "Stopped" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Failed" => 3.0,
        _ => -1.0,
    };
    gauge!("artifact_replication_tailer_state").set(value);
}

/// Record a cursor registration attempt.
pub fn record_cursor_open(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("artifact_replication_cursor_opens_total", "status" => status).increment(1);
}

/// Record a tailer restart (cursor failure or liveness-forced).
pub fn record_tailer_restart(reason: &str) {
    counter!("artifact_replication_tailer_restarts_total", "reason" => reason.to_string())
        .increment(1);
}

/// Record a log read.
pub fn record_log_read(entries: usize, duration: Duration) {
    counter!("artifact_replication_log_reads_total").increment(1);
    if entries > 0 {
        counter!("artifact_replication_log_entries_read_total").increment(entries as u64);
    }
    histogram!("artifact_replication_log_read_duration_seconds").record(duration.as_secs_f64());
}

/// Record a log entry that produced no work.
pub fn record_log_entry_skipped(reason: &str) {
    counter!("artifact_replication_log_entries_skipped_total", "reason" => reason.to_string())
        .increment(1);
}

/// Record lag between an entry's creation and its dispatch.
pub fn record_log_lag_ms(lag_ms: u64) {
    gauge!("artifact_replication_log_lag_ms").set(lag_ms as f64);
}

/// Record a liveness check result.
pub fn record_liveness_check(healthy: bool) {
    let status = if healthy { "healthy" } else { "unhealthy" };
    counter!("artifact_replication_liveness_checks_total", "status" => status).increment(1);
}

/// Record checkpoint flush batch (debounced writes).
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("artifact_replication_checkpoint_flushes_total").increment(1);
    counter!("artifact_replication_checkpoint_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("artifact_replication_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

// =============================================================================
// Push Metrics
// =============================================================================

/// Record jobs queued on a cluster lane.
pub fn record_jobs_enqueued(cluster: &str, count: usize) {
    counter!("artifact_replication_jobs_enqueued_total", "cluster" => cluster.to_string())
        .increment(count as u64);
}

/// Record a finished push job.
pub fn record_push(cluster: &str, repo_type: &str, outcome: &str, duration: Duration) {
    counter!(
        "artifact_replication_pushes_total",
        "cluster" => cluster.to_string(),
        "repo_type" => repo_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "artifact_replication_push_duration_seconds",
        "cluster" => cluster.to_string(),
        "repo_type" => repo_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a protocol fallback (e.g. Helm PUT → multipart POST).
pub fn record_push_fallback(cluster: &str, repo_type: &str, status: u16) {
    counter!(
        "artifact_replication_push_fallbacks_total",
        "cluster" => cluster.to_string(),
        "repo_type" => repo_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record bytes sent to a remote cluster.
pub fn record_push_bytes(cluster: &str, bytes: u64) {
    counter!("artifact_replication_push_bytes_total", "cluster" => cluster.to_string())
        .increment(bytes);
}

/// Gauge for consecutive push failures per cluster.
pub fn set_cluster_failures(cluster: &str, consecutive: u64) {
    gauge!("artifact_replication_cluster_consecutive_failures", "cluster" => cluster.to_string())
        .set(consecutive as f64);
}

/// Record errors by type.
pub fn record_error(cluster: &str, error_type: &str) {
    counter!(
        "artifact_replication_errors_total",
        "cluster" => cluster.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// Task Store Metrics
// =============================================================================

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_task_store_retry(operation: &str) {
    counter!("artifact_replication_task_store_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a task execution outcome.
pub fn record_task_execution(task_key: &str, outcome: &str) {
    counter!(
        "artifact_replication_task_executions_total",
        "task" => task_key.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Edge Cache Metrics
// =============================================================================

/// Record a cache blob upload attempt.
pub fn record_cache_sync(success: bool, bytes: u64) {
    let status = if success { "success" } else { "failure" };
    counter!("artifact_replication_cache_syncs_total", "status" => status).increment(1);
    if success {
        counter!("artifact_replication_cache_sync_bytes_total").increment(bytes);
    }
}

/// Record cache files evicted in one walk.
pub fn record_cache_evicted(count: usize) {
    counter!("artifact_replication_cache_evicted_total").increment(count as u64);
}

/// Record a full cache walk.
pub fn record_cache_walk(files: usize, duration: Duration) {
    counter!("artifact_replication_cache_walks_total").increment(1);
    histogram!("artifact_replication_cache_walk_files").record(files as f64);
    histogram!("artifact_replication_cache_walk_duration_seconds").record(duration.as_secs_f64());
}
