// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory collaborators for driving the Replicator without Docker.
//!
//! - [`ScriptedSource`]: replays a fixed log, honours `SubscribeFrom`, can
//!   disconnect or fail subscribes on cue.
//! - [`MemorySink`]: records every bulk write; per-destination faults.
//! - [`MemoryCheckpointStore`]: regression-checked checkpoint with
//!   injectable write failures. Share one `Arc` across two replicators to
//!   simulate a restart.
//!
//! All use `std::sync::Mutex` and never hold it across an await, so they
//! behave under `start_paused` runtimes (no real I/O to auto-advance past).

use change_replicator::checkpoint::{CheckpointRecord, CheckpointStore};
use change_replicator::error::{BoxFuture, ReplicationError};
use change_replicator::sink::{self, BulkWriteReport, OperationFailure, SinkError, TargetSink, WriteOp};
use change_replicator::source::{EventSource, SubscribeFrom};
use change_replicator::{ChangeEvent, OperationKind, Position};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

// =============================================================================
// Event helpers
// =============================================================================

/// Position `{ms}-0`.
pub fn pos(ms: u64) -> Position {
    Position::new(format!("{}-0", ms))
}

/// Update event carrying `doc`, at position `{ms}-0`.
pub fn upsert(ms: u64, destination: &str, key: &str, doc: Value) -> ChangeEvent {
    ChangeEvent::upsert(pos(ms), ms as i64, destination, OperationKind::Update, key, doc)
}

/// Delete event at position `{ms}-0`.
pub fn delete(ms: u64, destination: &str, key: &str) -> ChangeEvent {
    ChangeEvent::delete(pos(ms), ms as i64, destination, key)
}

// =============================================================================
// ScriptedSource
// =============================================================================

/// One entry in the scripted feed.
#[derive(Debug, Clone)]
pub enum Entry {
    Event(ChangeEvent),
    /// Reported as `MalformedEvent` at this position.
    Malformed(Position),
}

impl Entry {
    fn position(&self) -> &Position {
        match self {
            Entry::Event(e) => &e.position,
            Entry::Malformed(p) => p,
        }
    }
}

/// Feed that replays a fixed log.
pub struct ScriptedSource {
    log: Vec<Entry>,
    cursor: usize,
    /// Entries handed out across all subscriptions.
    delivered: usize,
    /// Fail `next_event` once when `delivered` reaches each of these.
    disconnect_at: VecDeque<usize>,
    /// Transient subscribe failures still to inject.
    subscribe_failures: usize,
    /// Positions at or below this are no longer retained.
    trimmed_through: Option<Position>,
    /// Block forever once the log is exhausted instead of ending the feed.
    hold_open: bool,
    subscriptions: Vec<SubscribeFrom>,
}

impl ScriptedSource {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self::from_entries(events.into_iter().map(Entry::Event).collect())
    }

    pub fn from_entries(log: Vec<Entry>) -> Self {
        Self {
            log,
            cursor: 0,
            delivered: 0,
            disconnect_at: VecDeque::new(),
            subscribe_failures: 0,
            trimmed_through: None,
            hold_open: false,
            subscriptions: Vec::new(),
        }
    }

    /// Drop the connection after `n` entries have been delivered in total.
    pub fn disconnect_after(mut self, n: usize) -> Self {
        self.disconnect_at.push_back(n);
        self
    }

    pub fn failing_subscribes(mut self, count: usize) -> Self {
        self.subscribe_failures = count;
        self
    }

    /// Pretend everything up to and including `position` was trimmed.
    pub fn trimmed_through(mut self, position: Position) -> Self {
        self.trimmed_through = Some(position);
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn subscriptions(&self) -> &[SubscribeFrom] {
        &self.subscriptions
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    fn retained(&self) -> impl Iterator<Item = (usize, &Entry)> {
        let trimmed = self.trimmed_through.clone();
        self.log
            .iter()
            .enumerate()
            .filter(move |(_, e)| trimmed.as_ref().map_or(true, |t| e.position() > t))
    }

    fn subscribe_impl(&mut self, from: SubscribeFrom) -> change_replicator::Result<Position> {
        self.subscriptions.push(from.clone());

        if self.subscribe_failures > 0 {
            self.subscribe_failures -= 1;
            return Err(ReplicationError::feed_msg("subscribe", "connection refused"));
        }

        match from {
            SubscribeFrom::Earliest => {
                let cursor = self.retained().next().map(|(i, _)| i).unwrap_or(self.log.len());
                self.cursor = cursor;
                Ok(Position::origin())
            }
            SubscribeFrom::Latest => {
                self.cursor = self.log.len();
                Ok(self.log.last().map(|e| e.position().clone()).unwrap_or_else(Position::origin))
            }
            SubscribeFrom::After(position) => {
                if let Some(trimmed) = &self.trimmed_through {
                    if !position.is_origin() && position < *trimmed {
                        return Err(ReplicationError::StreamTrimmed {
                            position: position.to_string(),
                            oldest: trimmed.to_string(),
                        });
                    }
                }
                let cursor = self
                    .retained()
                    .find(|(_, e)| *e.position() > position)
                    .map(|(i, _)| i)
                    .unwrap_or(self.log.len());
                self.cursor = cursor;
                Ok(position)
            }
        }
    }
}

impl EventSource for ScriptedSource {
    fn subscribe(&mut self, from: SubscribeFrom) -> BoxFuture<'_, Position> {
        let result = self.subscribe_impl(from);
        Box::pin(async move { result })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<ChangeEvent>> {
        Box::pin(async move {
            if self.disconnect_at.front() == Some(&self.delivered) {
                self.disconnect_at.pop_front();
                return Err(ReplicationError::feed_msg("xread", "connection reset by peer"));
            }

            let Some(entry) = self.log.get(self.cursor).cloned() else {
                if self.hold_open {
                    std::future::pending::<()>().await;
                }
                return Ok(None);
            };

            // Let timers and shutdown get a look in between events. Nothing is
            // consumed until after this point, so a cancelled call loses nothing.
            tokio::task::yield_now().await;
            self.cursor += 1;
            self.delivered += 1;

            match entry {
                Entry::Event(event) => Ok(Some(event)),
                Entry::Malformed(position) => Err(ReplicationError::malformed(position.to_string(), "unparseable payload")),
            }
        })
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Fault applied to the next bulk write of one destination.
#[derive(Debug, Clone)]
pub enum SinkFault {
    /// Whole write fails, may succeed on retry.
    Transient,
    /// Whole write fails, will never succeed.
    Permanent,
    /// Write succeeds except for these keys, which may succeed on retry.
    RejectKeys(Vec<String>),
    /// Write succeeds except for these documents, which will never be accepted.
    RejectDocuments(Vec<String>),
}

/// One recorded bulk write call.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub at: Instant,
    pub destination: String,
    pub ops: Vec<WriteOp>,
}

#[derive(Default)]
struct SinkState {
    docs: BTreeMap<(String, String), Value>,
    writes: Vec<WriteRecord>,
    faults: HashMap<String, VecDeque<SinkFault>>,
}

/// Target store kept in a map, one namespace per destination.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fault for the next write to `destination`.
    pub fn fail_next(&self, destination: &str, fault: SinkFault) {
        let mut state = self.state.lock().unwrap();
        state
            .faults
            .entry(destination.to_string())
            .or_default()
            .push_back(fault);
    }

    pub fn get(&self, destination: &str, key: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state.docs.get(&(destination.to_string(), key.to_string())).cloned()
    }

    pub fn count(&self, destination: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.docs.keys().filter(|(d, _)| d == destination).count()
    }

    /// Snapshot of every stored document, for comparing runs.
    pub fn snapshot(&self) -> BTreeMap<(String, String), Value> {
        self.state.lock().unwrap().docs.clone()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().unwrap().writes.clone()
    }

    fn apply(state: &mut SinkState, destination: &str, op: &WriteOp) {
        let key = (destination.to_string(), op.key().to_string());
        match op {
            WriteOp::Upsert { document, .. } => {
                state.docs.insert(key, document.clone());
            }
            WriteOp::Delete { .. } => {
                state.docs.remove(&key);
            }
        }
    }

    fn write(&self, destination: &str, ops: Vec<WriteOp>) -> sink::SinkResult<BulkWriteReport> {
        let mut state = self.state.lock().unwrap();
        state.writes.push(WriteRecord {
            at: Instant::now(),
            destination: destination.to_string(),
            ops: ops.clone(),
        });

        let fault = state.faults.get_mut(destination).and_then(|q| q.pop_front());
        let (rejected, retryable, message) = match fault {
            Some(SinkFault::Transient) => return Err(SinkError::transient("target unavailable")),
            Some(SinkFault::Permanent) => return Err(SinkError::permanent("not authorized")),
            Some(SinkFault::RejectKeys(keys)) => (keys, true, "write conflict"),
            Some(SinkFault::RejectDocuments(keys)) => (keys, false, "document failed validation"),
            None => (Vec::new(), true, ""),
        };

        let mut report = BulkWriteReport::default();
        for op in &ops {
            if rejected.iter().any(|k| k == op.key()) {
                report.failures.push(OperationFailure {
                    key: op.key().to_string(),
                    message: message.to_string(),
                    retryable,
                });
            } else {
                Self::apply(&mut state, destination, op);
                report.applied += 1;
            }
        }
        Ok(report)
    }
}

impl TargetSink for MemorySink {
    fn bulk_write<'a>(&'a self, destination: &'a str, ops: Vec<WriteOp>) -> sink::BoxFuture<'a, BulkWriteReport> {
        let result = self.write(destination, ops);
        Box::pin(async move { result })
    }
}

// =============================================================================
// MemoryCheckpointStore
// =============================================================================

/// Checkpoint store kept in memory.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    current: Mutex<Option<CheckpointRecord>>,
    history: Mutex<Vec<CheckpointRecord>>,
    failing_advances: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(record: CheckpointRecord) -> Self {
        let store = Self::default();
        *store.current.lock().unwrap() = Some(record);
        store
    }

    /// Make the next `count` advances fail.
    pub fn fail_next_advances(&self, count: usize) {
        self.failing_advances.store(count, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<CheckpointRecord> {
        self.current.lock().unwrap().clone()
    }

    /// Every successfully stored record, in order.
    pub fn history(&self) -> Vec<CheckpointRecord> {
        self.history.lock().unwrap().clone()
    }

    fn advance_impl(&self, record: CheckpointRecord) -> change_replicator::Result<()> {
        let failing = self.failing_advances.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_advances.store(failing - 1, Ordering::SeqCst);
            return Err(ReplicationError::checkpoint_msg("advance", "disk I/O error"));
        }

        let mut current = self.current.lock().unwrap();
        if let Some(existing) = current.as_ref() {
            if record.position < existing.position {
                return Err(ReplicationError::InvalidState {
                    expected: format!("position >= {}", existing.position),
                    actual: record.position.to_string(),
                });
            }
        }
        *current = Some(record.clone());
        self.history.lock().unwrap().push(record);
        Ok(())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn read(&self) -> BoxFuture<'_, Option<CheckpointRecord>> {
        let current = self.current();
        Box::pin(async move { Ok(current) })
    }

    fn advance(&self, record: CheckpointRecord) -> BoxFuture<'_, ()> {
        let result = self.advance_impl(record);
        Box::pin(async move { result })
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        *self.current.lock().unwrap() = None;
        Box::pin(async { Ok(()) })
    }
}
