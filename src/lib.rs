//! # Change Replicator
//!
//! Consumes an ordered change feed, groups the mutations into batches per
//! destination, applies each batch to a target store as one idempotent bulk
//! write, and records progress as a durable checkpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          change-replicator                                │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌─────────┐    ┌───────────┐  │
//! │  │ EventSource │───►│ BatchAccumulator │───►│ Flusher │───►│TargetSink │  │
//! │  │ (XREAD)     │    │ (size/age/bytes) │    │ (bulk)  │    │ (SQLite)  │  │
//! │  └─────────────┘    └──────────────────┘    └─────────┘    └───────────┘  │
//! │         ▲                                        │                        │
//! │         │ resume after                           ▼ all applied            │
//! │         │                              ┌─────────────────┐                │
//! │         └──────────────────────────────│ CheckpointStore │                │
//! │                                        │ (SQLite)        │                │
//! │                                        └─────────────────┘                │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once**: the checkpoint only moves after a batch is fully
//!   applied; anything after it is replayed on restart.
//! - **Idempotent writes**: full-document upserts keyed by document key, so
//!   replays converge to the same target state.
//! - **Last write wins per key** within a batch: operations are collapsed
//!   to the one with the highest position.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use change_replicator::{
//!     RedisStreamSource, ReplicationConfig, Replicator, SqliteCheckpointStore, SqliteSink,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> change_replicator::Result<()> {
//!     let config = ReplicationConfig::load("replicator.toml")?;
//!     let source = RedisStreamSource::new(config.source_config());
//!     let sink = Arc::new(SqliteSink::open(&config.target.sqlite_path).await?);
//!     let checkpoints = Arc::new(
//!         SqliteCheckpointStore::open(&config.checkpoint.sqlite_path, config.replication_id()).await?,
//!     );
//!
//!     let mut replicator = Replicator::new(config, source, sink, checkpoints)?;
//!     let shutdown = replicator.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     replicator.run().await
//! }
//! ```

pub mod accumulator;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod flusher;
pub mod metrics;
pub mod replicator;
pub mod resilience;
pub mod sink;
pub mod source;

// Re-exports for convenience
pub use accumulator::{BatchAccumulator, BatchConfig, PendingBatch};
pub use checkpoint::{CheckpointRecord, CheckpointStore, SqliteCheckpointStore};
pub use config::{LogFormat, Origin, ReplicationConfig, StartFrom};
pub use error::{ReplicationError, Result};
pub use event::{ChangeEvent, OperationKind, Position};
pub use flusher::{FlushResult, FlushStatus, Flusher};
pub use replicator::{Replicator, ReplicatorState, ReplicatorStats, ShutdownHandle};
pub use sink::{SqliteSink, TargetSink, WriteOp};
pub use source::{EventSource, RedisSourceConfig, RedisStreamSource, SubscribeFrom};
