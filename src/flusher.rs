// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flusher: applies a drained batch to the Target Sink.
//!
//! # Design
//!
//! ```text
//! PendingBatch ──┬──▶ dest A: collapse by key ──▶ bulk_write(A) ──┐
//!                ├──▶ dest B: collapse by key ──▶ bulk_write(B) ──┼──▶ FlushResult
//!                └──▶ dest C: collapse by key ──▶ bulk_write(C) ──┘
//!                         (bounded by the flush bulkhead)
//! ```
//!
//! Each destination gets exactly one unordered bulk write per flush. Because
//! the sink may apply those operations in any order, operations for the same
//! key are collapsed to the one with the highest position first; the result
//! converges to the last write regardless of sink ordering, and replaying the
//! batch yields the same state.

use crate::accumulator::PendingBatch;
use crate::resilience::Bulkhead;
use crate::sink::{OperationFailure, SinkError, TargetSink, WriteOp};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// Outcome of flushing one destination.
#[derive(Debug, Clone, PartialEq)]
pub enum DestinationOutcome {
    /// Every operation was confirmed by the sink.
    Applied { operations: usize },
    /// The destination's portion of the batch is not (fully) applied.
    Failed {
        error: SinkError,
        /// Individual rejected operations, when the sink reports partial success.
        failed_operations: Vec<OperationFailure>,
    },
}

impl DestinationOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DestinationOutcome::Applied { .. })
    }

    /// Whether retrying this destination may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DestinationOutcome::Applied { .. } => false,
            DestinationOutcome::Failed { error, .. } => error.retryable,
        }
    }
}

/// Overall status of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Success,
    Partial,
    Failed,
}

impl FlushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushStatus::Success => "success",
            FlushStatus::Partial => "partial",
            FlushStatus::Failed => "failure",
        }
    }
}

impl std::fmt::Display for FlushStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying a batch, per destination.
#[derive(Debug, Clone, Default)]
pub struct FlushResult {
    pub outcomes: BTreeMap<String, DestinationOutcome>,
}

impl FlushResult {
    /// `Success` when every destination applied (an empty batch is a success).
    pub fn status(&self) -> FlushStatus {
        let failed = self.outcomes.values().filter(|o| !o.is_applied()).count();
        if failed == 0 {
            FlushStatus::Success
        } else if failed == self.outcomes.len() {
            FlushStatus::Failed
        } else {
            FlushStatus::Partial
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == FlushStatus::Success
    }

    pub fn failed_destinations(&self) -> impl Iterator<Item = (&str, &DestinationOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_applied())
            .map(|(d, o)| (d.as_str(), o))
    }

    /// First failure that retrying cannot fix, if any.
    pub fn permanent_failure(&self) -> Option<(&str, &SinkError)> {
        self.outcomes.iter().find_map(|(dest, outcome)| match outcome {
            DestinationOutcome::Failed { error, .. } if !error.retryable => Some((dest.as_str(), error)),
            _ => None,
        })
    }

    /// Total operations confirmed across destinations.
    pub fn applied_operations(&self) -> usize {
        self.outcomes
            .values()
            .map(|o| match o {
                DestinationOutcome::Applied { operations } => *operations,
                DestinationOutcome::Failed { .. } => 0,
            })
            .sum()
    }
}

/// Collapse operations to one per key, keeping the highest position.
///
/// Output order follows the first appearance of each key.
pub fn collapse_by_key(ops: Vec<WriteOp>) -> Vec<WriteOp> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(ops.len());
    let mut collapsed: Vec<WriteOp> = Vec::with_capacity(ops.len());

    for op in ops {
        match index.get(op.key()) {
            Some(&i) => {
                if op.position() >= collapsed[i].position() {
                    collapsed[i] = op;
                }
            }
            None => {
                index.insert(op.key().to_string(), collapsed.len());
                collapsed.push(op);
            }
        }
    }

    collapsed
}

/// Applies batches to the Target Sink.
pub struct Flusher<S: TargetSink> {
    sink: Arc<S>,
    bulkhead: Bulkhead,
}

impl<S: TargetSink> Flusher<S> {
    /// Create a flusher allowing up to `max_concurrent` destinations in flight.
    pub fn new(sink: Arc<S>, max_concurrent: usize) -> Self {
        Self {
            sink,
            bulkhead: Bulkhead::new(max_concurrent.max(1)),
        }
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// Apply every destination of `batch`.
    ///
    /// Never returns early: every destination gets an outcome.
    #[instrument(skip(self, batch), fields(events = batch.event_count()))]
    pub async fn apply(&self, batch: &PendingBatch) -> FlushResult {
        let mut result = FlushResult::default();
        if batch.is_empty() {
            return result;
        }

        let mut join_set: JoinSet<(String, DestinationOutcome)> = JoinSet::new();

        for (destination, ops) in batch.operations() {
            let destination = destination.clone();
            let ops = ops.clone();
            let sink = Arc::clone(&self.sink);
            let bulkhead = self.bulkhead.clone();

            join_set.spawn(async move {
                // Closed only if the bulkhead is dropped, which cannot happen
                // while this flusher is alive.
                let _permit = bulkhead.acquire().await.ok();
                let outcome = flush_destination(sink.as_ref(), &destination, ops).await;
                (destination, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((destination, outcome)) => {
                    result.outcomes.insert(destination, outcome);
                }
                Err(e) => {
                    // The destination name is lost with the panicked task;
                    // record it under a synthetic name so the flush is not
                    // mistaken for a success.
                    warn!(error = %e, "Destination flush task failed (JoinError)");
                    result.outcomes.insert(
                        format!("<task-{}>", result.outcomes.len()),
                        DestinationOutcome::Failed {
                            error: SinkError::transient(format!("flush task failed: {}", e)),
                            failed_operations: Vec::new(),
                        },
                    );
                }
            }
        }

        result
    }
}

/// Write one destination's operations as a single bulk call.
async fn flush_destination<S: TargetSink>(
    sink: &S,
    destination: &str,
    ops: Vec<WriteOp>,
) -> DestinationOutcome {
    let submitted = ops.len();
    let ops = collapse_by_key(ops);
    let count = ops.len();

    debug!(
        destination = %destination,
        submitted,
        collapsed = submitted - count,
        "Submitting bulk write"
    );

    match sink.bulk_write(destination, ops).await {
        Ok(report) if report.is_complete() => DestinationOutcome::Applied {
            operations: report.applied,
        },
        Ok(report) => {
            let rejected = report.permanent_failure().map(|f| (f.key.clone(), f.message.clone()));
            warn!(
                destination = %destination,
                applied = report.applied,
                failed = report.failures.len(),
                retryable = rejected.is_none(),
                "Bulk write partially failed"
            );
            let error = match rejected {
                Some((key, message)) => {
                    SinkError::permanent(format!("document {} rejected: {}", key, message))
                }
                None => SinkError::transient(format!(
                    "{} of {} operations rejected",
                    report.failures.len(),
                    count
                )),
            };
            DestinationOutcome::Failed {
                error,
                failed_operations: report.failures,
            }
        }
        Err(error) => {
            warn!(
                destination = %destination,
                error = %error,
                retryable = error.retryable,
                "Bulk write failed"
            );
            DestinationOutcome::Failed {
                error,
                failed_operations: Vec::new(),
            }
        }
    }
}
