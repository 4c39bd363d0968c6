// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator state types.
//!
//! # State Transitions
//!
//! ```text
//!   run()
//! Init ──────────▶ Subscribing ──────────▶ Streaming
//!   │                  ▲  │                  │   │
//!   │                  │  │ (retries         │   │ shutdown / end of feed
//!   │   Reconnecting ◀─┼──┼── exhausted) ◀───┘   ▼
//!   │        │         │  │  transient       Draining
//!   │        └─────────┘  │  feed/sink error     │
//!   │                     ▼                      ▼
//!   └──── (fatal) ───▶ Terminated ◀──────────────┘
//! ```
//!
//! - **Init**: Created; reads the checkpoint when `run()` starts.
//! - **Subscribing**: Opening the feed, retrying with backoff.
//! - **Streaming**: Consuming, accumulating, flushing, checkpointing.
//! - **Reconnecting**: Pending work discarded; resubscribing at the checkpoint.
//! - **Draining**: Best-effort flush of the partial batch before exit.
//! - **Terminated**: Clean shutdown or unrecoverable error. Cannot be restarted.

/// State of the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Init,
    Subscribing,
    Streaming,
    Reconnecting,
    Draining,
    Terminated,
}

impl ReplicatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicatorState::Init => "Init",
            ReplicatorState::Subscribing => "Subscribing",
            ReplicatorState::Streaming => "Streaming",
            ReplicatorState::Reconnecting => "Reconnecting",
            ReplicatorState::Draining => "Draining",
            ReplicatorState::Terminated => "Terminated",
        }
    }
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters describing what a run has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicatorStats {
    /// Events accepted into the accumulator.
    pub events_accepted: u64,
    /// Malformed events skipped.
    pub events_malformed: u64,
    /// Duplicate or out-of-order events dropped.
    pub events_dropped: u64,
    /// Flush attempts, including retries.
    pub flushes: u64,
    /// Durable checkpoint advances.
    pub checkpoints: u64,
    /// Resubscriptions after the first subscribe.
    pub reconnects: u64,
}

/// Why the streaming loop stopped.
#[derive(Debug)]
pub(crate) enum StreamExit {
    /// Shutdown requested.
    Shutdown,
    /// Source reported end of feed.
    FeedEnded,
    /// Recoverable failure: discard pending work and resubscribe.
    Reconnect(crate::error::ReplicationError),
    /// Unrecoverable failure.
    Fatal(crate::error::ReplicationError),
}
