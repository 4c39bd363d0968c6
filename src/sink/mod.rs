// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target Sink integration.
//!
//! The replicator only needs one thing from the target store: apply an
//! unordered bulk write of upsert-by-key / delete-by-key operations to a
//! destination and report what failed. Everything else (connection pooling,
//! auth, wire protocol) lives behind [`TargetSink`].
//!
//! # Example
//!
//! ```rust,no_run
//! use change_replicator::sink::{BoxFuture, BulkWriteReport, TargetSink, WriteOp};
//!
//! struct MyTarget { /* ... */ }
//!
//! impl TargetSink for MyTarget {
//!     fn bulk_write<'a>(
//!         &'a self,
//!         _destination: &'a str,
//!         ops: Vec<WriteOp>,
//!     ) -> BoxFuture<'a, BulkWriteReport> {
//!         Box::pin(async move { Ok(BulkWriteReport::applied(ops.len())) })
//!     }
//! }
//! ```

pub mod sqlite;

pub use sqlite::SqliteSink;

use crate::event::{ChangeEvent, OperationKind, Position};
use std::future::Future;
use std::pin::Pin;

/// Result type for sink operations.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Type alias for boxed async futures returned by sinks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = SinkResult<T>> + Send + 'a>>;

/// Destination-level sink failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    pub message: String,
    /// Whether the same write may succeed if retried.
    pub retryable: bool,
}

impl SinkError {
    /// Failure that may clear on retry (timeouts, unreachable target).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that will not clear on retry (auth, permissions).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SinkError {}

/// One idempotent write against a destination.
///
/// Upserts carry the full document state as of `position`, so applying the
/// same op twice, or replaying an older batch, cannot leave a document in a
/// state that never existed at the source.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace-or-insert the full document under `key`.
    Upsert {
        key: String,
        document: serde_json::Value,
        position: Position,
    },
    /// Remove the document under `key` (no-op if absent).
    Delete { key: String, position: Position },
}

impl WriteOp {
    /// Convert a change event into its write operation.
    ///
    /// Returns `None` for an insert/update with no document.
    pub fn from_event(event: ChangeEvent) -> Option<Self> {
        match event.operation {
            OperationKind::Insert | OperationKind::Update => {
                event.document.map(|document| WriteOp::Upsert {
                    key: event.document_key,
                    document,
                    position: event.position,
                })
            }
            OperationKind::Delete => Some(WriteOp::Delete {
                key: event.document_key,
                position: event.position,
            }),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            WriteOp::Upsert { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }

    pub fn position(&self) -> &Position {
        match self {
            WriteOp::Upsert { position, .. } | WriteOp::Delete { position, .. } => position,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, WriteOp::Delete { .. })
    }
}

/// A single operation the sink could not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    pub key: String,
    pub message: String,
    /// Whether resubmitting the same op may succeed. A document the target
    /// rejects on its content never will.
    pub retryable: bool,
}

/// Outcome of one bulk write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteReport {
    /// Operations the sink confirmed.
    pub applied: usize,
    /// Operations the sink rejected (partial success).
    pub failures: Vec<OperationFailure>,
}

impl BulkWriteReport {
    pub fn applied(count: usize) -> Self {
        Self {
            applied: count,
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// First rejected op that retrying cannot fix, if any.
    pub fn permanent_failure(&self) -> Option<&OperationFailure> {
        self.failures.iter().find(|f| !f.retryable)
    }
}

/// Trait defining what we need from the target store.
///
/// The bulk write is unordered: the sink may apply `ops` in any order or in
/// parallel. Callers must not submit two ops for the same key in one call
/// unless either outcome is acceptable.
pub trait TargetSink: Send + Sync + 'static {
    /// Apply `ops` to `destination`.
    ///
    /// `Err` means the destination as a whole could not be written (nothing
    /// may be assumed applied). `Ok` with failures means partial success.
    fn bulk_write<'a>(&'a self, destination: &'a str, ops: Vec<WriteOp>)
        -> BoxFuture<'a, BulkWriteReport>;
}
