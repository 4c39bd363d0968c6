// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Stream change feed.
//!
//! Tails a stream whose entries each carry one change event:
//!
//! | Field  | Required            | Meaning                                    |
//! |--------|---------------------|--------------------------------------------|
//! | `op`   | yes                 | `insert`, `update` (`replace`), `delete`   |
//! | `ns`   | yes                 | destination namespace, e.g. `shop.orders`  |
//! | `key`  | yes                 | document key                               |
//! | `ts`   | no                  | source timestamp (ms); defaults to the ID  |
//! | `doc`  | insert/update only  | full document JSON, optionally zstd        |
//! | `hash` | no                  | SHA-256 hex of the decompressed `doc`      |
//!
//! The stream entry ID is the event's position.
//!
//! # Stream Trimming
//!
//! Redis streams can be trimmed via `MAXLEN` or `MINID` to bound memory.
//! If the resume position is older than the oldest retained entry we may
//! have missed events. `subscribe` reports this as `StreamTrimmed` so the
//! caller can log the potential gap and resubscribe from the earliest entry.

use super::{decode_document, EventSource, SubscribeFrom};
use crate::error::{BoxFuture, ReplicationError, Result};
use crate::event::{compare_positions, ChangeEvent, OperationKind, Position};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

type RawEntry = (String, HashMap<String, redis::Value>);

/// Connection and read settings for [`RedisStreamSource`].
#[derive(Debug, Clone)]
pub struct RedisSourceConfig {
    /// Redis URL, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Stream key to tail.
    pub stream_key: String,
    /// Block timeout for XREAD.
    pub block_timeout: Duration,
    /// Max entries per read.
    pub read_count: usize,
    /// Destinations to replicate. Empty means all.
    pub destinations: Vec<String>,
}

impl RedisSourceConfig {
    pub fn new(url: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_key: stream_key.into(),
            block_timeout: Duration::from_secs(5),
            read_count: 100,
            destinations: Vec::new(),
        }
    }
}

/// Event Source backed by a Redis stream.
pub struct RedisStreamSource {
    config: RedisSourceConfig,
    filter: HashSet<String>,
    conn: Option<ConnectionManager>,
    /// ID of the last entry moved into `buffer`; the next XREAD starts after it.
    cursor: Position,
    /// Entries read but not yet handed out. Kept across cancelled calls.
    buffer: VecDeque<RawEntry>,
}

impl RedisStreamSource {
    pub fn new(config: RedisSourceConfig) -> Self {
        let filter = config.destinations.iter().cloned().collect();
        Self {
            config,
            filter,
            conn: None,
            cursor: Position::origin(),
            buffer: VecDeque::new(),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.config.stream_key
    }

    async fn connection(&mut self) -> Result<&mut ConnectionManager> {
        if self.conn.is_none() {
            let client = redis::Client::open(self.config.url.as_str())
                .map_err(|e| ReplicationError::feed("connect", e))?;
            let conn = ConnectionManager::new(client)
                .await
                .map_err(|e| ReplicationError::feed("connect", e))?;
            info!(stream = %self.config.stream_key, "Connected to Redis");
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| ReplicationError::Internal("connection missing after connect".into()))
    }

    /// Oldest (`XRANGE - +`) or newest (`XREVRANGE + -`) entry ID.
    async fn edge_id(&mut self, newest: bool) -> Result<Option<String>> {
        let (cmd, start, end) = if newest {
            ("XREVRANGE", "+", "-")
        } else {
            ("XRANGE", "-", "+")
        };
        let key = self.config.stream_key.clone();
        let conn = self.connection().await?;

        let result: Vec<RawEntry> = redis::cmd(cmd)
            .arg(&key)
            .arg(start)
            .arg(end)
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| ReplicationError::feed(cmd, e))?;

        Ok(result.into_iter().next().map(|(id, _)| id))
    }

    async fn subscribe_impl(&mut self, from: SubscribeFrom) -> Result<Position> {
        // Buffered entries belong to the previous subscription.
        self.buffer.clear();

        let start = match from {
            SubscribeFrom::Earliest => Position::origin(),
            SubscribeFrom::Latest => self
                .edge_id(true)
                .await?
                .map(Position::new)
                .unwrap_or_else(Position::origin),
            SubscribeFrom::After(position) => {
                if !position.is_origin() {
                    if let Some(oldest) = self.edge_id(false).await? {
                        if compare_positions(position.as_str(), &oldest) == std::cmp::Ordering::Less {
                            return Err(ReplicationError::StreamTrimmed {
                                position: position.to_string(),
                                oldest,
                            });
                        }
                    }
                }
                position
            }
        };

        // Probe so connection failures surface here rather than mid-stream.
        self.connection().await?;

        debug!(stream = %self.config.stream_key, start = %start, "Subscribed");
        self.cursor = start.clone();
        Ok(start)
    }

    /// Read the next chunk of entries after the cursor into the buffer.
    async fn refill(&mut self) -> Result<()> {
        let opts = StreamReadOptions::default()
            .block(self.config.block_timeout.as_millis() as usize)
            .count(self.config.read_count);
        let key = self.config.stream_key.clone();
        let cursor = self.cursor.to_string();
        let conn = self.connection().await?;

        // XREAD BLOCK timeout COUNT n STREAMS key cursor
        let reply: StreamReadReply = conn
            .xread_options(&[&key], &[&cursor], &opts)
            .await
            .map_err(|e| ReplicationError::feed("XREAD", e))?;

        for stream in reply.keys {
            for entry in stream.ids {
                self.cursor = Position::new(entry.id.clone());
                self.buffer.push_back((entry.id, entry.map));
            }
        }

        if !self.buffer.is_empty() {
            trace!(count = self.buffer.len(), cursor = %self.cursor, "Read stream entries");
        }
        Ok(())
    }

    async fn next_event_impl(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            if let Some((id, fields)) = self.buffer.pop_front() {
                let event = parse_entry(&id, &fields)?;
                if !self.filter.is_empty() && !self.filter.contains(&event.destination) {
                    trace!(position = %id, destination = %event.destination, "Destination not replicated, skipping");
                    continue;
                }
                return Ok(Some(event));
            }

            if let Err(e) = self.refill().await {
                // Drop the connection so the next subscribe reconnects.
                self.conn = None;
                return Err(e);
            }
        }
    }
}

impl EventSource for RedisStreamSource {
    fn subscribe(&mut self, from: SubscribeFrom) -> BoxFuture<'_, Position> {
        Box::pin(async move {
            let result = self.subscribe_impl(from).await;
            if matches!(result, Err(ReplicationError::TransientFeed { .. })) {
                self.conn = None;
            }
            result
        })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Option<ChangeEvent>> {
        Box::pin(self.next_event_impl())
    }
}

/// Extract a string field from a stream entry.
fn get_string_field(
    fields: &HashMap<String, redis::Value>,
    name: &str,
) -> std::result::Result<Option<String>, String> {
    match fields.get(name) {
        None | Some(redis::Value::Nil) => Ok(None),
        Some(redis::Value::BulkString(bytes)) => String::from_utf8(bytes.clone())
            .map(Some)
            .map_err(|e| format!("invalid UTF-8 in {}: {}", name, e)),
        Some(redis::Value::SimpleString(s)) => Ok(Some(s.clone())),
        Some(redis::Value::Int(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(format!("unexpected type for field {}: {:?}", name, other)),
    }
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(
    fields: &HashMap<String, redis::Value>,
    name: &str,
) -> std::result::Result<Option<Vec<u8>>, String> {
    match fields.get(name) {
        None | Some(redis::Value::Nil) => Ok(None),
        Some(redis::Value::BulkString(bytes)) => Ok(Some(bytes.clone())),
        Some(redis::Value::SimpleString(s)) => Ok(Some(s.as_bytes().to_vec())),
        Some(other) => Err(format!("unexpected type for field {}: {:?}", name, other)),
    }
}

/// Parse one stream entry into a change event.
///
/// Any problem is reported as `MalformedEvent` at the entry's ID.
pub fn parse_entry(id: &str, fields: &HashMap<String, redis::Value>) -> Result<ChangeEvent> {
    parse_entry_inner(id, fields).map_err(|reason| {
        warn!(position = %id, reason = %reason, "Malformed stream entry");
        ReplicationError::malformed(id, reason)
    })
}

fn parse_entry_inner(
    id: &str,
    fields: &HashMap<String, redis::Value>,
) -> std::result::Result<ChangeEvent, String> {
    let required = |name: &str| -> std::result::Result<String, String> {
        get_string_field(fields, name)?.ok_or_else(|| format!("missing field: {}", name))
    };

    let op_str = required("op")?;
    let operation = OperationKind::parse(&op_str).ok_or_else(|| format!("unknown op: {}", op_str))?;
    let destination = required("ns")?;
    let document_key = required("key")?;
    let position = Position::new(id);

    let timestamp = match get_string_field(fields, "ts")? {
        Some(ts) => ts.parse::<i64>().map_err(|e| format!("invalid ts '{}': {}", ts, e))?,
        None => position.millis().map(|m| m as i64).unwrap_or(0),
    };

    let event = if operation.requires_document() {
        let raw = get_bytes_field(fields, "doc")?
            .ok_or_else(|| format!("{} without full document", operation))?;
        let hash = get_string_field(fields, "hash")?;
        let document = decode_document(&raw, hash.as_deref())?;
        ChangeEvent::upsert(position, timestamp, destination, operation, document_key, document)
    } else {
        ChangeEvent::delete(position, timestamp, destination, document_key)
    };

    event.validate()?;
    Ok(event)
}
