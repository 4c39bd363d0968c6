// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed Target Sink.
//!
//! Each destination maps to its own table holding one row per document key:
//!
//! ```text
//! "shop.orders" (doc_key TEXT PRIMARY KEY, document TEXT, position TEXT, updated_at INTEGER)
//! ```
//!
//! A bulk write runs inside one transaction. Busy/locked errors abort the
//! transaction and are retried with backoff. Any other per-statement error
//! (constraint, datatype) depends only on the op itself, so it is reported
//! as a non-retryable failed operation while the rest of the batch commits.

use super::{BoxFuture, BulkWriteReport, OperationFailure, SinkError, TargetSink, WriteOp};
use crate::checkpoint::{execute_with_retry, is_sqlite_busy_error, open_sqlite_pool};
use crate::error::{ReplicationError, Result};
use sqlx::sqlite::SqlitePool;
use std::collections::HashSet;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Quote a destination name for use as a SQLite identifier.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Classify a sqlx error as a sink failure.
fn classify(e: &sqlx::Error) -> SinkError {
    let retryable = is_sqlite_busy_error(e)
        || matches!(
            e,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
        );
    SinkError {
        message: e.to_string(),
        retryable,
    }
}

/// Target Sink writing full documents into SQLite tables.
pub struct SqliteSink {
    pool: SqlitePool,
    /// Destinations whose table is known to exist.
    tables: Mutex<HashSet<String>>,
    path: String,
}

impl SqliteSink {
    /// Open (or create) the target database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening SQLite target");

        let pool = open_sqlite_pool(&path_str, true)
            .await
            .map_err(|e| ReplicationError::Sink {
                destination: path_str.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            pool,
            tables: Mutex::new(HashSet::new()),
            path: path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn ensure_table(&self, destination: &str) -> std::result::Result<(), sqlx::Error> {
        let mut tables = self.tables.lock().await;
        if tables.contains(destination) {
            return Ok(());
        }

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                doc_key TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                position TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            quote_identifier(destination)
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        debug!(destination = %destination, "Created destination table");
        tables.insert(destination.to_string());
        Ok(())
    }

    async fn write_transaction(
        &self,
        destination: &str,
        ops: &[WriteOp],
    ) -> std::result::Result<BulkWriteReport, sqlx::Error> {
        let table = quote_identifier(destination);
        let upsert = format!(
            "INSERT INTO {} (doc_key, document, position, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(doc_key) DO UPDATE SET
                 document = excluded.document,
                 position = excluded.position,
                 updated_at = excluded.updated_at",
            table
        );
        let delete = format!("DELETE FROM {} WHERE doc_key = ?", table);
        let now = chrono::Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;
        let mut report = BulkWriteReport::default();

        for op in ops {
            let result = match op {
                WriteOp::Upsert {
                    key,
                    document,
                    position,
                } => {
                    sqlx::query(&upsert)
                        .bind(key)
                        .bind(document.to_string())
                        .bind(position.as_str())
                        .bind(now)
                        .execute(&mut *tx)
                        .await
                }
                WriteOp::Delete { key, .. } => sqlx::query(&delete).bind(key).execute(&mut *tx).await,
            };

            match result {
                Ok(_) => report.applied += 1,
                // Contention aborts the whole transaction so it can be retried.
                Err(e) if is_sqlite_busy_error(&e) => return Err(e),
                Err(e) => report.failures.push(OperationFailure {
                    key: op.key().to_string(),
                    message: e.to_string(),
                    retryable: false,
                }),
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    /// Fetch the stored document for `key`, if any.
    pub async fn get(&self, destination: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let sql = format!(
            "SELECT document FROM {} WHERE doc_key = ?",
            quote_identifier(destination)
        );
        let row: Option<(String,)> = match sqlx::query_as(&sql).bind(key).fetch_optional(&self.pool).await {
            Ok(row) => row,
            // Table not created yet means nothing was ever written there.
            Err(sqlx::Error::Database(e)) if e.message().contains("no such table") => None,
            Err(e) => {
                return Err(ReplicationError::Sink {
                    destination: destination.to_string(),
                    message: e.to_string(),
                })
            }
        };

        row.map(|(doc,)| serde_json::from_str(&doc))
            .transpose()
            .map_err(|e| ReplicationError::Internal(format!("stored document is not JSON: {}", e)))
    }

    /// Number of documents stored for `destination`.
    pub async fn count(&self, destination: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(destination));
        match sqlx::query_as::<_, (i64,)>(&sql).fetch_one(&self.pool).await {
            Ok((n,)) => Ok(n.max(0) as u64),
            Err(sqlx::Error::Database(e)) if e.message().contains("no such table") => Ok(0),
            Err(e) => Err(ReplicationError::Sink {
                destination: destination.to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl TargetSink for SqliteSink {
    fn bulk_write<'a>(&'a self, destination: &'a str, ops: Vec<WriteOp>) -> BoxFuture<'a, BulkWriteReport> {
        Box::pin(async move {
            if ops.is_empty() {
                return Ok(BulkWriteReport::default());
            }

            self.ensure_table(destination).await.map_err(|e| classify(&e))?;

            let ops = &ops;
            execute_with_retry("sink_bulk_write", move || async move {
                self.write_transaction(destination, ops).await
            })
            .await
            .map_err(|e| classify(&e))
        })
    }
}
