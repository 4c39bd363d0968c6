// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for replication progress.
//!
//! Stores the position of the last event whose batch was fully applied to
//! the target, one record per (source, target) pair. The checkpoint is the
//! sole recovery anchor: on restart the feed resumes strictly after it.
//!
//! # Write-through
//!
//! Unlike a debounced cursor, [`CheckpointStore::advance`] returns only
//! once the record is durable. The Replicator does not consume further
//! events past a flush until its checkpoint has been confirmed, and treats
//! a failed write as fatal.
//!
//! ```text
//! flush batch (last event 1234) ─▶ all destinations applied ─▶ advance(1234)
//!                                  (crash here = replay batch, idempotent)
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Those are retried with exponential backoff (bounded); any
//! other error, or exhausting the retries, surfaces as
//! [`ReplicationError::CheckpointPersistence`].

use crate::error::{BoxFuture, ReplicationError, Result};
use crate::event::Position;
use crate::metrics;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Durable replication progress for one (source, target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Position of the last event in the last fully applied batch.
    pub position: Position,
    /// Source timestamp (ms) of that event.
    pub timestamp: i64,
}

impl CheckpointRecord {
    pub fn new(position: Position, timestamp: i64) -> Self {
        Self {
            position,
            timestamp,
        }
    }
}

/// Trait defining what the Replicator needs from checkpoint storage.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Read the current checkpoint. `None` on first run.
    fn read(&self) -> BoxFuture<'_, Option<CheckpointRecord>>;

    /// Durably record `record` as the new checkpoint.
    ///
    /// Must reject a position lower than the stored one.
    fn advance(&self, record: CheckpointRecord) -> BoxFuture<'_, ()>;

    /// Delete the checkpoint (explicit operator reset).
    fn reset(&self) -> BoxFuture<'_, ()>;
}

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                metrics::record_sqlite_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Open a SQLite pool the way both the checkpoint store and the sink need.
///
/// `:memory:` gets a single, never-recycled connection, since every new
/// connection would otherwise see its own empty database.
pub(crate) async fn open_sqlite_pool(path: &str, wal_mode: bool) -> std::result::Result<SqlitePool, sqlx::Error> {
    let in_memory = path == ":memory:";
    let url = if in_memory {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{}?mode=rwc", path)
    };

    let mut options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
    if wal_mode && !in_memory {
        options = options
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
    } else {
        options = options.synchronous(sqlx::sqlite::SqliteSynchronous::Full);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(2)
    };

    pool_options.connect_with(options).await
}

/// Checkpoint storage backed by SQLite.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    /// Identifies the (source, target) pair this store tracks.
    replication_id: String,
    /// Last durable record, for regression checks without a round trip.
    cache: RwLock<Option<CheckpointRecord>>,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (or create) the checkpoint table at `path`.
    pub async fn open(path: impl AsRef<Path>, replication_id: impl Into<String>) -> Result<Self> {
        Self::open_with(path, replication_id, true).await
    }

    pub async fn open_with(
        path: impl AsRef<Path>,
        replication_id: impl Into<String>,
        wal_mode: bool,
    ) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let replication_id = replication_id.into();
        info!(path = %path_str, replication_id = %replication_id, "Opening checkpoint store");

        let pool = open_sqlite_pool(&path_str, wal_mode)
            .await
            .map_err(|e| ReplicationError::checkpoint("open", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                replication_id TEXT PRIMARY KEY,
                position TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| ReplicationError::checkpoint("create_table", e))?;

        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT position, timestamp FROM checkpoints WHERE replication_id = ?",
        )
        .bind(&replication_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| ReplicationError::checkpoint("load", e))?;

        let cached = row.map(|(position, timestamp)| {
            CheckpointRecord::new(Position::new(position), timestamp)
        });

        match &cached {
            Some(record) => info!(position = %record.position, "Restored checkpoint from previous run"),
            None => info!("No checkpoint found, first run for this replication pair"),
        }

        Ok(Self {
            pool,
            replication_id,
            cache: RwLock::new(cached),
            path: path_str,
        })
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn read_impl(&self) -> Result<Option<CheckpointRecord>> {
        Ok(self.cache.read().await.clone())
    }

    async fn advance_impl(&self, record: CheckpointRecord) -> Result<()> {
        // Hold the write lock across the disk write so concurrent advances
        // cannot interleave their regression checks.
        let mut cache = self.cache.write().await;

        if let Some(current) = cache.as_ref() {
            if record.position < current.position {
                metrics::record_checkpoint_advance(false);
                return Err(ReplicationError::InvalidState {
                    expected: format!("position >= {}", current.position),
                    actual: record.position.to_string(),
                });
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let replication_id = &self.replication_id;
        let position = record.position.as_str();
        let timestamp = record.timestamp;

        let result = execute_with_retry("checkpoint_advance", move || async move {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (replication_id, position, timestamp, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(replication_id) DO UPDATE SET
                    position = excluded.position,
                    timestamp = excluded.timestamp,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(replication_id)
            .bind(position)
            .bind(timestamp)
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        match result {
            Ok(_) => {
                debug!(position = %record.position, "Checkpoint advanced");
                metrics::record_checkpoint_advance(true);
                *cache = Some(record);
                Ok(())
            }
            Err(e) => {
                metrics::record_checkpoint_advance(false);
                Err(ReplicationError::checkpoint("advance", e))
            }
        }
    }

    async fn reset_impl(&self) -> Result<()> {
        let mut cache = self.cache.write().await;
        let pool = &self.pool;
        let replication_id = &self.replication_id;

        execute_with_retry("checkpoint_reset", move || async move {
            sqlx::query("DELETE FROM checkpoints WHERE replication_id = ?")
                .bind(replication_id)
                .execute(pool)
                .await
        })
        .await
        .map_err(|e| ReplicationError::checkpoint("reset", e))?;

        *cache = None;
        info!(replication_id = %self.replication_id, "Checkpoint reset");
        Ok(())
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn wal_checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint_wal", move || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await
        .map_err(|e| ReplicationError::checkpoint("wal_checkpoint", e))?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.wal_checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn read(&self) -> BoxFuture<'_, Option<CheckpointRecord>> {
        Box::pin(self.read_impl())
    }

    fn advance(&self, record: CheckpointRecord) -> BoxFuture<'_, ()> {
        Box::pin(self.advance_impl(record))
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.reset_impl())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(pos: &str, ts: i64) -> CheckpointRecord {
        CheckpointRecord::new(Position::new(pos), ts)
    }

    #[tokio::test]
    async fn test_checkpoint_store_basic() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("checkpoints.db");

        let store = SqliteCheckpointStore::open(&db_path, "src->dst").await.unwrap();
        assert!(store.read().await.unwrap().is_none());

        store.advance(record("1700000000000-0", 10)).await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(record("1700000000000-0", 10)));

        store.advance(record("1700000000001-0", 11)).await.unwrap();
        assert_eq!(
            store.read().await.unwrap().unwrap().position,
            Position::new("1700000000001-0")
        );

        store.close().await;
    }

    #[tokio::test]
    async fn test_checkpoint_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("persist.db");

        {
            let store = SqliteCheckpointStore::open(&db_path, "pair").await.unwrap();
            store.advance(record("9999-0", 99)).await.unwrap();
            store.close().await;
        }

        {
            let store = SqliteCheckpointStore::open(&db_path, "pair").await.unwrap();
            assert_eq!(store.read().await.unwrap(), Some(record("9999-0", 99)));
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_checkpoint_rejects_regression() {
        let store = SqliteCheckpointStore::open(":memory:", "pair").await.unwrap();
        store.advance(record("10-0", 1)).await.unwrap();

        let err = store.advance(record("9-5", 1)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));

        // Unchanged
        assert_eq!(store.read().await.unwrap().unwrap().position, Position::new("10-0"));

        // Equal position is allowed (non-decreasing)
        store.advance(record("10-0", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_pairs_are_isolated() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("pairs.db");

        let a = SqliteCheckpointStore::open(&db_path, "a->x").await.unwrap();
        a.advance(record("5-0", 5)).await.unwrap();
        a.close().await;

        let b = SqliteCheckpointStore::open(&db_path, "b->x").await.unwrap();
        assert!(b.read().await.unwrap().is_none());
        b.close().await;
    }

    #[tokio::test]
    async fn test_checkpoint_reset() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("reset.db");

        let store = SqliteCheckpointStore::open(&db_path, "pair").await.unwrap();
        store.advance(record("5-0", 5)).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.read().await.unwrap().is_none());
        store.close().await;

        let reopened = SqliteCheckpointStore::open(&db_path, "pair").await.unwrap();
        assert!(reopened.read().await.unwrap().is_none());

        // After reset any position is accepted again
        reopened.advance(record("1-0", 1)).await.unwrap();
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_non_database() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
