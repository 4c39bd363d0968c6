// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Every failure the replication loop can observe is classified into one of
//! the kinds below, so the retry/fatal decision is made by matching on the
//! variant rather than by catching everything around the loop.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `TransientFeed` | Yes | No | Event Source connection blip; reconnect at checkpoint |
//! | `TransientSink` | Yes | No | Target write failed; retry the drained batch |
//! | `MalformedEvent` | No | No | Unparseable event; skipped and logged |
//! | `StreamTrimmed` | No | No | Resume position no longer retained by the source |
//! | `Sink` | No | Yes | Non-retryable target failure (auth, permissions) |
//! | `CheckpointPersistence` | No | Yes | Checkpoint could not be read or written |
//! | `Config` | No | Yes | Configuration invalid |
//! | `InvalidState` | No | Yes | Replicator state machine violation |
//! | `Shutdown` | No | No | Replicator is shutting down |
//! | `Internal` | No | Yes | Unexpected internal error |

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Boxed async result, used by the source and checkpoint traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur during replication.
///
/// Use [`is_retryable()`](Self::is_retryable) to decide whether to back off
/// and try again, and [`is_fatal()`](Self::is_fatal) to decide whether the
/// run must stop.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Event Source read or subscribe failure.
    ///
    /// Network errors, timeouts, dropped connections. The Replicator
    /// reconnects with backoff and resumes at the last checkpoint.
    #[error("Transient feed error ({operation}): {message}")]
    TransientFeed {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Target Sink write failure that may succeed on retry.
    #[error("Transient sink error ({destination}): {message}")]
    TransientSink { destination: String, message: String },

    /// Target Sink failure that will not succeed on retry.
    #[error("Sink error ({destination}): {message}")]
    Sink { destination: String, message: String },

    /// Event missing required fields or carrying an unparseable payload.
    ///
    /// Skipped and logged. Its position is never used as a checkpoint.
    #[error("Malformed event at {position}: {reason}")]
    MalformedEvent { position: String, reason: String },

    /// The source no longer retains entries at or after the resume position.
    #[error("Stream trimmed past {position}; oldest retained entry is {oldest}")]
    StreamTrimmed { position: String, oldest: String },

    /// Checkpoint store read/write failure.
    ///
    /// Fatal: progress is not trustworthy across a restart without a
    /// durable checkpoint.
    #[error("Checkpoint persistence error ({operation}): {message}")]
    CheckpointPersistence {
        operation: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// State machine violation (e.g. running an already-terminated replicator).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a feed error from a redis::RedisError.
    pub fn feed(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::TransientFeed {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a feed error without source.
    pub fn feed_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientFeed {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a checkpoint error from a sqlx::Error.
    pub fn checkpoint(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::CheckpointPersistence {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a checkpoint error without source.
    pub fn checkpoint_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CheckpointPersistence {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a malformed event error.
    pub fn malformed(position: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            position: position.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientFeed { .. } => true,
            Self::TransientSink { .. } => true,
            Self::Sink { .. } => false,
            Self::MalformedEvent { .. } => false, // Skipped, not retried
            Self::StreamTrimmed { .. } => false,
            Self::CheckpointPersistence { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must terminate the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Sink { .. }
                | Self::CheckpointPersistence { .. }
                | Self::Config(_)
                | Self::InvalidState { .. }
                | Self::Internal(_)
        )
    }

    /// Short, stable name of the error kind (for logs and metrics labels).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientFeed { .. } => "transient_feed",
            Self::TransientSink { .. } => "transient_sink",
            Self::Sink { .. } => "sink",
            Self::MalformedEvent { .. } => "malformed_event",
            Self::StreamTrimmed { .. } => "stream_trimmed",
            Self::CheckpointPersistence { .. } => "checkpoint_persistence",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::feed("unknown", e)
    }
}
