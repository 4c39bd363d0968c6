// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Emitted through the `metrics` facade; the embedding binary decides which
//! recorder (if any) to install. Covers:
//! - Feed consumption (events read, dropped, malformed)
//! - Batch flushes (status, size, age, duration)
//! - Checkpoint advances
//! - Reconnects and sink retries
//! - Replication lag and replicator state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Feed
// =============================================================================

/// Record events read from the Event Source.
pub fn record_events_read(count: usize) {
    counter!("replicator_events_read_total").increment(count as u64);
}

/// Record an event dropped before accumulation (e.g. `out_of_order`).
pub fn record_event_dropped(reason: &'static str) {
    counter!("replicator_events_dropped_total", "reason" => reason).increment(1);
}

/// Record a malformed event skipped at the feed boundary.
pub fn record_malformed_event() {
    counter!("replicator_malformed_events_total").increment(1);
}

/// Record the source no longer retaining the resume position.
pub fn record_stream_trimmed() {
    counter!("replicator_stream_trimmed_total").increment(1);
}

/// Record a feed reconnect and why it happened.
pub fn record_reconnect(reason: &str) {
    counter!("replicator_reconnects_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Batching and Flushes
// =============================================================================

/// Gauge for what is currently pending in the accumulator.
pub fn set_pending(events: usize, bytes: usize) {
    gauge!("replicator_pending_events").set(events as f64);
    gauge!("replicator_pending_bytes").set(bytes as f64);
}

/// Record one flush attempt of a batch.
pub fn record_flush(status: &'static str, events: usize, batch_age: Duration, duration: Duration) {
    counter!("replicator_flushes_total", "status" => status).increment(1);
    histogram!("replicator_batch_size").record(events as f64);
    histogram!("replicator_batch_age_seconds").record(batch_age.as_secs_f64());
    histogram!("replicator_flush_duration_seconds").record(duration.as_secs_f64());
}

/// Record a destination-level flush outcome.
pub fn record_destination_flush(destination: &str, success: bool, operations: usize) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replicator_destination_flushes_total",
        "destination" => destination.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        counter!("replicator_operations_applied_total", "destination" => destination.to_string())
            .increment(operations as u64);
    }
}

/// Record an early flush forced by the pending-bytes cap.
pub fn record_memory_cap_flush(destination: &str) {
    counter!("replicator_memory_cap_flushes_total", "destination" => destination.to_string())
        .increment(1);
}

/// Record a retry of failed destinations.
pub fn record_sink_retry(attempt: usize) {
    counter!("replicator_sink_retries_total").increment(1);
    gauge!("replicator_sink_retry_attempt").set(attempt as f64);
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Record a checkpoint advance.
pub fn record_checkpoint_advance(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_checkpoint_advances_total", "status" => status).increment(1);
}

/// Record a SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_sqlite_retry(operation: &str) {
    counter!("replicator_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Lag and State
// =============================================================================

/// Lag between the newest flushed event's source timestamp and now.
pub fn record_replication_lag_ms(lag_ms: u64) {
    gauge!("replicator_lag_ms").set(lag_ms as f64);
    histogram!("replicator_lag_seconds").record(lag_ms as f64 / 1000.0);
}

/// Gauge for replicator state.
pub fn set_replicator_state(state: &str) {
    // Numeric so it can be alerted on (e.g. Reconnecting for too long).
    let value = match state {
        "Init" => 0.0,
        "Subscribing" => 1.0,
        "Streaming" => 2.0,
        "Reconnecting" => 3.0,
        "Draining" => 4.0,
        "Terminated" => 5.0,
        _ => -1.0,
    };
    gauge!("replicator_state").set(value);
}
