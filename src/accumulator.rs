// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch accumulator for change events.
//!
//! Groups pending writes by destination and decides when a flush is due.
//!
//! # Design
//!
//! ```text
//! ChangeEvents ──▶ BatchAccumulator ──┬──▶ size trigger  (event_count >= size_threshold)
//!                  │                  ├──▶ time trigger  (age >= time_threshold)
//!                  │ BTreeMap<dest,   └──▶ memory cap    (byte_size > max_pending_bytes)
//!                  │   Vec<WriteOp>>
//!                  ▼
//!             drain() ──▶ PendingBatch (immutable, handed to the Flusher)
//! ```
//!
//! Unlike a latest-wins map, the accumulator keeps every operation in
//! arrival order, even for a key that is already pending. Collapsing to the
//! highest position happens in the Flusher, right before the bulk write.
//!
//! The accumulator does no I/O and is owned by the single consuming loop,
//! so it needs no locking.

use crate::checkpoint::CheckpointRecord;
use crate::event::ChangeEvent;
use crate::sink::WriteOp;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Configuration for batch accumulation.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush once this many events are pending.
    pub size_threshold: usize,
    /// Flush once the oldest pending event is this old.
    pub time_threshold: Duration,
    /// Flush the largest destination early once pending bytes exceed this.
    pub max_pending_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size_threshold: 100,
            time_threshold: Duration::from_millis(1000),
            max_pending_bytes: 16 * 1024 * 1024,
        }
    }
}

impl BatchConfig {
    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            size_threshold: 10,
            time_threshold: Duration::from_millis(5),
            max_pending_bytes: 1024 * 1024,
        }
    }
}

/// A drained batch. Immutable once handed out.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    operations: BTreeMap<String, Vec<WriteOp>>,
    created_at: Instant,
    event_count: usize,
    /// Approximate payload bytes per destination.
    bytes: BTreeMap<String, usize>,
    checkpoint: Option<CheckpointRecord>,
}

impl PendingBatch {
    /// Operations per destination, each list in arrival order.
    pub fn operations(&self) -> &BTreeMap<String, Vec<WriteOp>> {
        &self.operations
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn byte_size(&self) -> usize {
        self.bytes.values().sum()
    }

    /// Position/timestamp of the last event folded into this batch.
    ///
    /// `None` for empty batches and for early per-destination drains,
    /// which must never advance the checkpoint on their own.
    pub fn checkpoint(&self) -> Option<&CheckpointRecord> {
        self.checkpoint.as_ref()
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    /// Age of the batch at `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Keep only the given destinations (used to retry failed ones).
    pub fn retain_destinations<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.operations.retain(|dest, _| keep(dest));
        let operations = &self.operations;
        self.bytes.retain(|dest, _| operations.contains_key(dest));
        self.event_count = self.operations.values().map(Vec::len).sum();
    }
}

/// Per-destination pending state.
#[derive(Debug, Default)]
struct DestinationQueue {
    ops: Vec<WriteOp>,
    bytes: usize,
}

/// Accumulates change events until a flush is due.
#[derive(Debug)]
pub struct BatchAccumulator {
    pending: BTreeMap<String, DestinationQueue>,
    /// When the current batch started accumulating.
    batch_start: Option<Instant>,
    event_count: usize,
    byte_size: usize,
    last: Option<CheckpointRecord>,
    config: BatchConfig,
}

impl BatchAccumulator {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending: BTreeMap::new(),
            batch_start: None,
            event_count: 0,
            byte_size: 0,
            last: None,
            config,
        }
    }

    /// Add a change event to the batch.
    ///
    /// Operations for a key that is already pending are appended, not
    /// replaced.
    pub fn add(&mut self, event: ChangeEvent) {
        self.add_at(event, Instant::now());
    }

    /// Add with an explicit arrival time (the batch clock starts at the
    /// first event).
    pub fn add_at(&mut self, event: ChangeEvent, now: Instant) {
        let size = event.approximate_size();
        let record = CheckpointRecord::new(event.position.clone(), event.timestamp);
        let destination = event.destination.clone();

        let Some(op) = WriteOp::from_event(event) else {
            warn!(
                destination = %destination,
                position = %record.position,
                "Upsert event without document, skipping"
            );
            return;
        };

        if self.batch_start.is_none() {
            self.batch_start = Some(now);
        }

        let queue = self.pending.entry(destination).or_default();
        queue.ops.push(op);
        queue.bytes += size;

        self.event_count += 1;
        self.byte_size += size;
        self.last = Some(record);
    }

    /// Check if a size or time flush is due at `now`.
    pub fn is_flush_due(&self, now: Instant) -> bool {
        if self.event_count == 0 {
            return false;
        }

        if self.event_count >= self.config.size_threshold {
            return true;
        }

        match self.batch_start {
            Some(start) => now.saturating_duration_since(start) >= self.config.time_threshold,
            None => false,
        }
    }

    /// Check if pending bytes exceed the memory cap.
    pub fn is_over_memory_cap(&self) -> bool {
        self.byte_size > self.config.max_pending_bytes
    }

    /// Instant at which the time trigger fires, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.batch_start.map(|start| start + self.config.time_threshold)
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.event_count
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Take everything pending and reset.
    pub fn drain(&mut self) -> PendingBatch {
        let pending = std::mem::take(&mut self.pending);
        let created_at = self.batch_start.take().unwrap_or_else(Instant::now);

        let mut operations = BTreeMap::new();
        let mut bytes = BTreeMap::new();
        for (dest, queue) in pending {
            bytes.insert(dest.clone(), queue.bytes);
            operations.insert(dest, queue.ops);
        }

        let batch = PendingBatch {
            operations,
            created_at,
            event_count: self.event_count,
            bytes,
            checkpoint: self.last.take(),
        };

        self.event_count = 0;
        self.byte_size = 0;
        batch
    }

    /// Take only the destination with the most pending bytes.
    ///
    /// The returned batch carries no checkpoint; the remaining events keep
    /// the current batch clock and checkpoint candidate.
    pub fn drain_largest(&mut self) -> Option<PendingBatch> {
        let largest = self
            .pending
            .iter()
            .max_by_key(|(_, q)| q.bytes)
            .map(|(dest, _)| dest.clone())?;

        let queue = self.pending.remove(&largest)?;
        let count = queue.ops.len();
        let created_at = self.batch_start.unwrap_or_else(Instant::now);

        self.event_count -= count;
        self.byte_size -= queue.bytes;

        if self.pending.is_empty() {
            // Nothing left to carry the clock; the candidate stays so the
            // next full drain still checkpoints past the early-flushed ops.
            self.batch_start = None;
        }

        let mut bytes = BTreeMap::new();
        bytes.insert(largest.clone(), queue.bytes);
        let mut operations = BTreeMap::new();
        operations.insert(largest, queue.ops);

        Some(PendingBatch {
            operations,
            created_at,
            event_count: count,
            bytes,
            checkpoint: None,
        })
    }

    /// Drop everything pending (after a reconnect the feed replays it).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.batch_start = None;
        self.event_count = 0;
        self.byte_size = 0;
        self.last = None;
    }
}
