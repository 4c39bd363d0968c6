// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator: the subscribe → accumulate → flush → checkpoint loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Replicator                              │
//! │                                                                  │
//! │  EventSource ──▶ validate / order check ──▶ BatchAccumulator     │
//! │       ▲                                        │ size / age /    │
//! │       │ resubscribe at checkpoint              ▼ memory cap      │
//! │       │                                     Flusher ──▶ TargetSink
//! │       │                                        │ all applied     │
//! │       └──── Reconnecting ◀── retries ──────────┤                 │
//! │                              exhausted         ▼                 │
//! │                                        CheckpointStore.advance   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Delivery Guarantee
//!
//! At-least-once. The checkpoint only moves after every destination of a
//! batch confirmed its write, so a crash anywhere replays from the last
//! checkpoint; full-document upserts make that replay harmless.
//!
//! # Graceful Shutdown
//!
//! [`ShutdownHandle::shutdown`] stops consumption at the next await point.
//! A flush already in progress is never interrupted. The partial batch is
//! then flushed once (best-effort) and, if fully applied, checkpointed.

mod types;

pub use types::{ReplicatorState, ReplicatorStats};

use crate::accumulator::{BatchAccumulator, PendingBatch};
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::config::{Origin, ReplicationConfig, StartFrom};
use crate::error::{ReplicationError, Result};
use crate::event::{ChangeEvent, Position};
use crate::flusher::{FlushResult, FlushStatus, Flusher};
use crate::metrics;
use crate::resilience::{RateLimiter, RetryConfig};
use crate::sink::TargetSink;
use crate::source::{EventSource, SubscribeFrom};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use types::StreamExit;

/// Where the first subscription of a run starts.
pub fn initial_subscription(
    start_from: StartFrom,
    origin: Origin,
    checkpoint: Option<&CheckpointRecord>,
) -> SubscribeFrom {
    match start_from {
        StartFrom::Resume => match checkpoint {
            Some(record) => SubscribeFrom::After(record.position.clone()),
            None => origin.into(),
        },
        StartFrom::Earliest => SubscribeFrom::Earliest,
        StartFrom::Latest => SubscribeFrom::Latest,
    }
}

/// Requests a graceful shutdown of a running replicator.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

enum Step {
    Shutdown,
    Deadline,
    Next(Result<Option<ChangeEvent>>),
}

/// The replication loop, generic over its three collaborators.
pub struct Replicator<Src, Snk, Cp>
where
    Src: EventSource,
    Snk: TargetSink,
    Cp: CheckpointStore,
{
    replication_id: String,
    start_from: StartFrom,
    origin: Origin,

    source: Src,
    flusher: Flusher<Snk>,
    checkpoints: Arc<Cp>,
    accumulator: BatchAccumulator,

    sink_retry: RetryConfig,
    reconnect_retry: RetryConfig,
    rate_limiter: Option<RateLimiter>,

    state_tx: watch::Sender<ReplicatorState>,
    state_rx: watch::Receiver<ReplicatorState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,

    /// Last durable checkpoint. Guards `advance` against regression.
    committed: Option<CheckpointRecord>,
    /// Highest checkpoint candidate this run fully applied, durable or not.
    applied: Option<Position>,
    /// Position of the last event observed on the current subscription.
    last_seen: Option<Position>,
    /// Resolved start of the first subscription; reconnects never go below it.
    floor: Option<Position>,
    stats: ReplicatorStats,
}

impl<Src, Snk, Cp> Replicator<Src, Snk, Cp>
where
    Src: EventSource,
    Snk: TargetSink,
    Cp: CheckpointStore,
{
    /// Create a replicator. Nothing is read or connected until [`run`](Self::run).
    pub fn new(
        config: ReplicationConfig,
        source: Src,
        sink: Arc<Snk>,
        checkpoints: Arc<Cp>,
    ) -> Result<Self> {
        config.validate()?;

        let (state_tx, state_rx) = watch::channel(ReplicatorState::Init);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            replication_id: config.replication_id(),
            start_from: config.start_from,
            origin: config.origin,
            source,
            flusher: Flusher::new(sink, config.batch.max_concurrent_flushes),
            checkpoints,
            accumulator: BatchAccumulator::new(config.batch_config()),
            sink_retry: config.retry.sink_retry(),
            reconnect_retry: config.retry.reconnect_retry(),
            rate_limiter: config.rate_limit_config().map(RateLimiter::new),
            state_tx,
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            committed: None,
            applied: None,
            last_seen: None,
            floor: None,
            stats: ReplicatorStats::default(),
        })
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_rx.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn stats(&self) -> &ReplicatorStats {
        &self.stats
    }

    /// Last checkpoint this run confirmed (or loaded at startup).
    pub fn committed(&self) -> Option<&CheckpointRecord> {
        self.committed.as_ref()
    }

    pub fn source(&self) -> &Src {
        &self.source
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// Run until shutdown, end of feed, or an unrecoverable error.
    ///
    /// Can only be called once.
    pub async fn run(&mut self) -> Result<()> {
        let state = self.state();
        if state != ReplicatorState::Init {
            return Err(ReplicationError::InvalidState {
                expected: ReplicatorState::Init.to_string(),
                actual: state.to_string(),
            });
        }

        let span = info_span!("replicator", replication_id = %self.replication_id);
        let result = self.run_inner().instrument(span).await;

        self.set_state(ReplicatorState::Terminated);
        match &result {
            Ok(()) => info!(
                replication_id = %self.replication_id,
                checkpoint = %self.committed.as_ref().map(|c| c.position.as_str()).unwrap_or("none"),
                "Replicator stopped cleanly"
            ),
            Err(e) => error!(
                replication_id = %self.replication_id,
                kind = e.kind(),
                error = %e,
                "Replicator terminated"
            ),
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        info!(start_from = ?self.start_from, origin = ?self.origin, "Starting replicator");

        self.committed = self.checkpoints.read().await?;
        let mut from = initial_subscription(self.start_from, self.origin, self.committed.as_ref());
        let mut consecutive_failures = 0usize;

        loop {
            self.set_state(ReplicatorState::Subscribing);
            let start = match self.subscribe_with_retry(from).await {
                Ok(start) => start,
                Err(ReplicationError::Shutdown) => {
                    info!("Shutdown requested while subscribing");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if self.floor.is_none() {
                self.floor = Some(start.clone());
            }
            self.last_seen = Some(start);
            self.set_state(ReplicatorState::Streaming);

            let applied_before = self.applied.clone();
            match self.stream().await {
                StreamExit::Shutdown | StreamExit::FeedEnded => {
                    self.set_state(ReplicatorState::Draining);
                    return self.drain().await;
                }
                StreamExit::Fatal(e) => return Err(e),
                StreamExit::Reconnect(cause) => {
                    if self.applied > applied_before {
                        consecutive_failures = 0;
                    }
                    consecutive_failures += 1;

                    self.set_state(ReplicatorState::Reconnecting);
                    self.stats.reconnects += 1;
                    metrics::record_reconnect(cause.kind());

                    let discarded = self.accumulator.len();
                    self.accumulator.clear();
                    metrics::set_pending(0, 0);

                    if !self.reconnect_retry.allows(consecutive_failures) {
                        error!(
                            kind = cause.kind(),
                            error = %cause,
                            attempts = consecutive_failures,
                            "Giving up after repeated failures without progress"
                        );
                        return Err(cause);
                    }

                    let resume = self.resume_position();
                    let delay = self.reconnect_retry.delay_for_attempt(consecutive_failures);
                    warn!(
                        kind = cause.kind(),
                        error = %cause,
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        discarded_events = discarded,
                        resume_after = %resume,
                        "Reconnecting to change feed"
                    );

                    if self.wait_or_shutdown(delay).await {
                        info!("Shutdown requested while reconnecting");
                        return Ok(());
                    }
                    from = SubscribeFrom::After(resume);
                }
            }
        }
    }

    /// Highest of what this run applied and the first subscription start.
    ///
    /// A checkpoint stored by an earlier run is deliberately ignored here:
    /// under `earliest` it may lie ahead of anything this run has written.
    fn resume_position(&self) -> Position {
        match (self.applied.as_ref(), self.floor.as_ref()) {
            (Some(a), Some(f)) => std::cmp::max(a, f).clone(),
            (Some(a), None) => a.clone(),
            (None, Some(f)) => f.clone(),
            (None, None) => Position::origin(),
        }
    }

    /// Subscribe, retrying transient failures. `Err(Shutdown)` if shutdown interrupted.
    async fn subscribe_with_retry(&mut self, mut from: SubscribeFrom) -> Result<Position> {
        let mut attempt = 0usize;

        loop {
            if self.is_shutdown() {
                return Err(ReplicationError::Shutdown);
            }

            match self.source.subscribe(from.clone()).await {
                Ok(start) => {
                    info!(from = %from, start = %start, "Subscribed to change feed");
                    return Ok(start);
                }
                Err(ReplicationError::StreamTrimmed { position, oldest }) => {
                    warn!(
                        kind = "stream_trimmed",
                        position = %position,
                        oldest = %oldest,
                        "Source no longer retains the resume position, potential data gap; resuming from earliest retained event"
                    );
                    metrics::record_stream_trimmed();
                    from = SubscribeFrom::Earliest;
                }
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if !self.reconnect_retry.allows(attempt) {
                        error!(kind = e.kind(), error = %e, attempts = attempt, "Subscribe retries exhausted");
                        return Err(e);
                    }
                    let delay = self.reconnect_retry.delay_for_attempt(attempt);
                    warn!(
                        kind = e.kind(),
                        error = %e,
                        from = %from,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Subscribe failed, retrying"
                    );
                    if self.wait_or_shutdown(delay).await {
                        return Err(ReplicationError::Shutdown);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream(&mut self) -> StreamExit {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow_and_update() {
                return StreamExit::Shutdown;
            }

            let deadline = self.accumulator.deadline();
            let step = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => Step::Shutdown,

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Step::Deadline
                }

                next = self.source.next_event() => Step::Next(next),
            };

            let outcome = match step {
                Step::Shutdown => return StreamExit::Shutdown,
                Step::Deadline => {
                    if self.accumulator.is_flush_due(Instant::now()) {
                        self.flush_pending().await
                    } else {
                        Ok(())
                    }
                }
                Step::Next(Ok(Some(event))) => self.accept(event).await,
                Step::Next(Ok(None)) => {
                    info!("Change feed ended");
                    return StreamExit::FeedEnded;
                }
                Step::Next(Err(ReplicationError::MalformedEvent { position, reason })) => {
                    warn!(kind = "malformed_event", position = %position, reason = %reason, "Skipping malformed event");
                    metrics::record_malformed_event();
                    self.stats.events_malformed += 1;
                    Ok(())
                }
                Step::Next(Err(ReplicationError::Shutdown)) => return StreamExit::Shutdown,
                Step::Next(Err(e)) if e.is_fatal() => return StreamExit::Fatal(e),
                Step::Next(Err(e)) => return StreamExit::Reconnect(e),
            };

            if let Err(exit) = outcome {
                return exit;
            }
        }
    }

    /// Validate, order-check and accumulate one event; flush if due.
    async fn accept(&mut self, event: ChangeEvent) -> std::result::Result<(), StreamExit> {
        metrics::record_events_read(1);

        if let Err(reason) = event.validate() {
            warn!(kind = "malformed_event", position = %event.position, reason = %reason, "Skipping malformed event");
            metrics::record_malformed_event();
            self.stats.events_malformed += 1;
            return Ok(());
        }

        if let Some(last) = &self.last_seen {
            if event.position <= *last {
                warn!(
                    position = %event.position,
                    last_seen = %last,
                    destination = %event.destination,
                    "Dropping duplicate or out-of-order event"
                );
                metrics::record_event_dropped("out_of_order");
                self.stats.events_dropped += 1;
                return Ok(());
            }
        }
        self.last_seen = Some(event.position.clone());

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        self.accumulator.add(event);
        self.stats.events_accepted += 1;
        metrics::set_pending(self.accumulator.len(), self.accumulator.byte_size());

        if self.accumulator.is_over_memory_cap() {
            self.relieve_memory_pressure().await?;
        }

        if self.accumulator.is_flush_due(Instant::now()) {
            self.flush_pending().await?;
        }

        Ok(())
    }

    /// Flush largest destinations until back under the byte cap.
    async fn relieve_memory_pressure(&mut self) -> std::result::Result<(), StreamExit> {
        while self.accumulator.is_over_memory_cap() {
            let Some(partial) = self.accumulator.drain_largest() else {
                break;
            };
            for destination in partial.destinations() {
                warn!(
                    destination = %destination,
                    bytes = partial.byte_size(),
                    events = partial.event_count(),
                    "Pending bytes over cap, flushing largest destination early"
                );
                metrics::record_memory_cap_flush(destination);
            }
            self.apply_with_retry(partial).await?;
        }

        metrics::set_pending(self.accumulator.len(), self.accumulator.byte_size());

        // Everything went out early; the checkpoint candidate is still owed.
        if self.accumulator.is_empty() {
            self.flush_pending().await?;
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> std::result::Result<(), StreamExit> {
        let batch = self.accumulator.drain();
        metrics::set_pending(0, 0);
        self.flush(batch).await
    }

    async fn flush(&mut self, batch: PendingBatch) -> std::result::Result<(), StreamExit> {
        let candidate = batch.checkpoint().cloned();
        if !batch.is_empty() {
            self.apply_with_retry(batch).await?;
        }
        if let Some(record) = candidate {
            self.mark_applied(&record.position);
            self.advance(record).await?;
        }
        Ok(())
    }

    fn mark_applied(&mut self, position: &Position) {
        if self.applied.as_ref().map_or(true, |a| position > a) {
            self.applied = Some(position.clone());
        }
    }

    /// Apply a batch, retrying only the failed destinations.
    async fn apply_with_retry(&mut self, batch: PendingBatch) -> std::result::Result<(), StreamExit> {
        let age = batch.age(Instant::now());
        let mut pending = batch;
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self.flusher.apply(&pending).await;
            self.record_flush(&pending, &result, age, started.elapsed(), attempt);

            if result.is_success() {
                return Ok(());
            }

            if let Some((destination, err)) = result.permanent_failure() {
                error!(
                    kind = "sink",
                    destination = %destination,
                    error = %err,
                    attempt,
                    "Non-retryable sink failure"
                );
                self.accumulator.clear();
                return Err(StreamExit::Fatal(ReplicationError::Sink {
                    destination: destination.to_string(),
                    message: err.message.clone(),
                }));
            }

            let failed: HashSet<String> = result
                .failed_destinations()
                .map(|(d, _)| d.to_string())
                .collect();
            let cause = transient_sink_error(&result);

            // A failure we cannot attribute to a destination cannot be retried
            // selectively.
            if failed.iter().any(|d| !pending.operations().contains_key(d)) {
                self.accumulator.clear();
                return Err(StreamExit::Reconnect(cause));
            }

            if !self.sink_retry.allows(attempt) {
                warn!(
                    kind = cause.kind(),
                    error = %cause,
                    attempts = attempt,
                    "Sink retries exhausted, escalating to reconnect"
                );
                return Err(StreamExit::Reconnect(cause));
            }

            let delay = self.sink_retry.delay_for_attempt(attempt);
            warn!(
                kind = cause.kind(),
                error = %cause,
                failed_destinations = failed.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Flush incomplete, retrying failed destinations"
            );
            metrics::record_sink_retry(attempt);

            if self.wait_or_shutdown(delay).await {
                // The unapplied batch must not be skipped by the drain flush.
                self.accumulator.clear();
                return Err(StreamExit::Shutdown);
            }

            pending.retain_destinations(|d| failed.contains(d));
        }
    }

    fn record_flush(
        &mut self,
        batch: &PendingBatch,
        result: &FlushResult,
        age: Duration,
        elapsed: Duration,
        attempt: usize,
    ) {
        let status = result.status();
        self.stats.flushes += 1;
        metrics::record_flush(status.as_str(), batch.event_count(), age, elapsed);
        for (destination, outcome) in &result.outcomes {
            let ops = match outcome {
                crate::flusher::DestinationOutcome::Applied { operations } => *operations,
                crate::flusher::DestinationOutcome::Failed { .. } => 0,
            };
            metrics::record_destination_flush(destination, outcome.is_applied(), ops);
        }

        let destinations = batch.destinations().collect::<Vec<_>>().join(",");
        if status == FlushStatus::Success {
            info!(
                events = batch.event_count(),
                operations = result.applied_operations(),
                batch_age_ms = age.as_millis() as u64,
                destinations = %destinations,
                status = %status,
                attempt,
                duration_ms = elapsed.as_millis() as u64,
                "Flushed batch"
            );
        } else {
            warn!(
                events = batch.event_count(),
                batch_age_ms = age.as_millis() as u64,
                destinations = %destinations,
                status = %status,
                attempt,
                duration_ms = elapsed.as_millis() as u64,
                "Flushed batch"
            );
        }
    }

    /// Durably advance the checkpoint. Never moves it backwards.
    async fn advance(&mut self, record: CheckpointRecord) -> std::result::Result<(), StreamExit> {
        if let Some(committed) = &self.committed {
            if record.position <= committed.position {
                debug!(
                    position = %record.position,
                    committed = %committed.position,
                    "Batch within already checkpointed range, checkpoint unchanged"
                );
                return Ok(());
            }
        }

        match self.checkpoints.advance(record.clone()).await {
            Ok(()) => {
                let lag_ms = (chrono::Utc::now().timestamp_millis() - record.timestamp).max(0) as u64;
                metrics::record_replication_lag_ms(lag_ms);
                debug!(position = %record.position, lag_ms, "Checkpoint advanced");
                self.committed = Some(record);
                self.stats.checkpoints += 1;
                Ok(())
            }
            Err(e) => {
                error!(
                    kind = e.kind(),
                    position = %record.position,
                    error = %e,
                    "Checkpoint write failed after successful flush, halting"
                );
                Err(StreamExit::Fatal(e))
            }
        }
    }

    /// Flush whatever is pending once, without retries.
    async fn drain(&mut self) -> Result<()> {
        let batch = self.accumulator.drain();
        metrics::set_pending(0, 0);

        if batch.is_empty() && batch.checkpoint().is_none() {
            info!("Nothing pending, drain complete");
            return Ok(());
        }

        let candidate = batch.checkpoint().cloned();
        if !batch.is_empty() {
            let age = batch.age(Instant::now());
            let started = Instant::now();
            let result = self.flusher.apply(&batch).await;
            self.record_flush(&batch, &result, age, started.elapsed(), 1);

            if !result.is_success() {
                warn!(
                    events = batch.event_count(),
                    checkpoint = %self.committed.as_ref().map(|c| c.position.as_str()).unwrap_or("none"),
                    "Drain flush incomplete; pending events will be replayed from the last checkpoint"
                );
                return Ok(());
            }
        }

        if let Some(record) = candidate {
            self.mark_applied(&record.position);
            match self.advance(record).await {
                Ok(()) => {}
                Err(StreamExit::Fatal(e)) => return Err(e),
                Err(_) => {}
            }
        }

        info!("Drain complete");
        Ok(())
    }

    fn set_state(&self, state: ReplicatorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Replicator state change");
            metrics::set_replicator_state(state.as_str());
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleep for `delay` unless shutdown is requested first. Returns `true` on shutdown.
    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut rx = self.shutdown_rx.clone();
        if *rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = rx.changed() => true,
        }
    }
}

/// Summarise the first failed destination of a flush.
fn transient_sink_error(result: &FlushResult) -> ReplicationError {
    match result.failed_destinations().next() {
        Some((destination, crate::flusher::DestinationOutcome::Failed { error, .. })) => {
            ReplicationError::TransientSink {
                destination: destination.to_string(),
                message: error.message.clone(),
            }
        }
        _ => ReplicationError::TransientSink {
            destination: "unknown".to_string(),
            message: "flush incomplete".to_string(),
        },
    }
}
