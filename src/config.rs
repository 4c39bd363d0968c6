// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replicator.
//!
//! Configuration is passed to [`Replicator::new()`](crate::Replicator::new)
//! and can be constructed programmatically or loaded from TOML.
//!
//! # Quick Start
//!
//! ```rust
//! use change_replicator::config::ReplicationConfig;
//!
//! let config = ReplicationConfig::for_testing("redis://localhost:6379", ":memory:");
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── source: SourceConfig          # Redis stream to tail
//! ├── target: TargetConfig          # SQLite target database
//! ├── destinations: Vec<String>     # Namespaces to replicate (empty = all)
//! ├── batch: BatchSettings          # Flush triggers and memory cap
//! ├── checkpoint: CheckpointConfig  # SQLite checkpoint persistence
//! ├── retry: RetrySettings          # Sink retry and reconnect backoff
//! ├── start_from / origin           # Startup resume policy
//! └── rate_limit_per_sec / _burst   # Optional consumption cap
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! start_from = "resume"
//! origin = "earliest"
//! destinations = ["shop.orders", "shop.users"]
//!
//! [source]
//! redis_url = "redis://localhost:6379"
//! stream_key = "cdc"
//!
//! [target]
//! sqlite_path = "/var/lib/replicator/target.db"
//!
//! [batch]
//! size_threshold = 100
//! time_threshold = "1000ms"
//!
//! [checkpoint]
//! sqlite_path = "/var/lib/replicator/checkpoints.db"
//! ```

use crate::accumulator::BatchConfig;
use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::source::{RedisSourceConfig, SubscribeFrom};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Replicator::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub source: SourceConfig,

    pub target: TargetConfig,

    /// Destinations to replicate. Events for anything else are skipped at
    /// the feed boundary. Empty means everything.
    #[serde(default)]
    pub destinations: Vec<String>,

    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Where to start when the process boots.
    #[serde(default)]
    pub start_from: StartFrom,

    /// Where `resume` starts when no checkpoint exists yet.
    #[serde(default)]
    pub origin: Origin,

    /// Optional cap on consumed events per second.
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,

    /// Burst allowance for the rate limit.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Log output format for the binary.
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_rate_limit_burst() -> u32 {
    100
}

impl ReplicationConfig {
    /// Create a minimal config for testing: fast timings, in-memory checkpoints.
    pub fn for_testing(redis_url: &str, target_path: &str) -> Self {
        Self {
            source: SourceConfig {
                redis_url: redis_url.to_string(),
                stream_key: "cdc".to_string(),
                block_timeout: "100ms".to_string(),
                read_count: 100,
            },
            target: TargetConfig {
                sqlite_path: target_path.to_string(),
            },
            destinations: Vec::new(),
            batch: BatchSettings::for_testing(),
            checkpoint: CheckpointConfig::in_memory(),
            retry: RetrySettings::for_testing(),
            start_from: StartFrom::Resume,
            origin: Origin::Earliest,
            rate_limit_per_sec: None,
            rate_limit_burst: default_rate_limit_burst(),
            log_format: LogFormat::Text,
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ReplicationError::Config(format!("invalid TOML: {}", e)))
    }

    /// Load and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check everything that can be checked without connecting anywhere.
    pub fn validate(&self) -> Result<()> {
        if self.source.redis_url.trim().is_empty() {
            return Err(ReplicationError::Config("source.redis_url is required".into()));
        }
        if self.source.stream_key.trim().is_empty() {
            return Err(ReplicationError::Config("source.stream_key is required".into()));
        }
        if self.source.read_count == 0 {
            return Err(ReplicationError::Config("source.read_count must be > 0".into()));
        }
        parse_duration("source.block_timeout", &self.source.block_timeout)?;

        if self.target.sqlite_path.trim().is_empty() {
            return Err(ReplicationError::Config("target.sqlite_path is required".into()));
        }
        if self.checkpoint.sqlite_path.trim().is_empty() {
            return Err(ReplicationError::Config("checkpoint.sqlite_path is required".into()));
        }
        if self.destinations.iter().any(|d| d.trim().is_empty()) {
            return Err(ReplicationError::Config("destinations must not contain empty names".into()));
        }

        if self.batch.size_threshold == 0 {
            return Err(ReplicationError::Config("batch.size_threshold must be > 0".into()));
        }
        if parse_duration("batch.time_threshold", &self.batch.time_threshold)?.is_zero() {
            return Err(ReplicationError::Config("batch.time_threshold must be > 0".into()));
        }
        if self.batch.max_pending_bytes == 0 {
            return Err(ReplicationError::Config("batch.max_pending_bytes must be > 0".into()));
        }
        if self.batch.max_concurrent_flushes == 0 {
            return Err(ReplicationError::Config("batch.max_concurrent_flushes must be > 0".into()));
        }

        if self.retry.sink_max_attempts == 0 {
            return Err(ReplicationError::Config("retry.sink_max_attempts must be > 0".into()));
        }
        parse_duration("retry.sink_initial_delay", &self.retry.sink_initial_delay)?;
        parse_duration("retry.sink_max_delay", &self.retry.sink_max_delay)?;
        parse_duration("retry.reconnect_initial_delay", &self.retry.reconnect_initial_delay)?;
        parse_duration("retry.reconnect_max_delay", &self.retry.reconnect_max_delay)?;

        if self.rate_limit_per_sec == Some(0) {
            return Err(ReplicationError::Config("rate_limit_per_sec must be > 0".into()));
        }

        Ok(())
    }

    /// Identifier of the (source, target) pair, unless configured explicitly.
    pub fn replication_id(&self) -> String {
        self.checkpoint.replication_id.clone().unwrap_or_else(|| {
            format!(
                "{}/{}->{}",
                self.source.redis_url, self.source.stream_key, self.target.sqlite_path
            )
        })
    }

    pub fn batch_config(&self) -> BatchConfig {
        let defaults = BatchConfig::default();
        BatchConfig {
            size_threshold: self.batch.size_threshold,
            time_threshold: humantime::parse_duration(&self.batch.time_threshold)
                .unwrap_or(defaults.time_threshold),
            max_pending_bytes: self.batch.max_pending_bytes,
        }
    }

    pub fn source_config(&self) -> RedisSourceConfig {
        RedisSourceConfig {
            url: self.source.redis_url.clone(),
            stream_key: self.source.stream_key.clone(),
            block_timeout: self.source.block_timeout_duration(),
            read_count: self.source.read_count,
            destinations: self.destinations.clone(),
        }
    }

    /// Create rate limit configuration. `None` when unlimited.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_per_sec.map(|per_sec| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: per_sec,
        })
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Config(format!("{}: invalid duration '{}': {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Startup policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a fresh process starts consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Resume after the checkpoint; fall back to `origin` without one.
    #[default]
    Resume,
    /// Ignore any checkpoint and replay from the oldest retained event.
    Earliest,
    /// Ignore any checkpoint and only replicate new events.
    Latest,
}

/// Starting point for `resume` on a first run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Earliest,
    Latest,
}

impl From<Origin> for SubscribeFrom {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Earliest => SubscribeFrom::Earliest,
            Origin::Latest => SubscribeFrom::Latest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig / TargetConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis stream carrying the change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub redis_url: String,

    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// XREAD block timeout as a duration string (e.g., "5s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries per XREAD call.
    #[serde(default = "default_read_count")]
    pub read_count: usize,
}

fn default_stream_key() -> String {
    "cdc".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_read_count() -> usize {
    100
}

impl SourceConfig {
    /// Parse the block_timeout string to a Duration.
    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout).unwrap_or(Duration::from_secs(5))
    }
}

/// SQLite database the documents are written into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub sqlite_path: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatchSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Flush triggers and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Flush once this many events are pending.
    #[serde(default = "default_size_threshold")]
    pub size_threshold: usize,

    /// Flush once the oldest pending event is this old (e.g., "1000ms").
    #[serde(default = "default_time_threshold")]
    pub time_threshold: String,

    /// Early-flush the largest destination once pending bytes exceed this.
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,

    /// Destinations flushed concurrently.
    #[serde(default = "default_max_concurrent_flushes")]
    pub max_concurrent_flushes: usize,
}

fn default_size_threshold() -> usize {
    100
}

fn default_time_threshold() -> String {
    "1000ms".to_string()
}

fn default_max_pending_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_max_concurrent_flushes() -> usize {
    8
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            size_threshold: default_size_threshold(),
            time_threshold: default_time_threshold(),
            max_pending_bytes: default_max_pending_bytes(),
            max_concurrent_flushes: default_max_concurrent_flushes(),
        }
    }
}

impl BatchSettings {
    pub fn for_testing() -> Self {
        Self {
            size_threshold: 10,
            time_threshold: "5ms".to_string(),
            max_pending_bytes: 1024 * 1024,
            max_concurrent_flushes: 4,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to SQLite database for checkpoint storage.
    #[serde(default = "default_checkpoint_path")]
    pub sqlite_path: String,

    /// Explicit replication id; derived from source and target when absent.
    #[serde(default)]
    pub replication_id: Option<String>,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_checkpoint_path() -> String {
    "replicator_checkpoints.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_checkpoint_path(),
            replication_id: None,
            wal_mode: true,
        }
    }
}

impl CheckpointConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            replication_id: Some("test".to_string()),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink retry and feed reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts at flushing a batch before escalating to a reconnect.
    #[serde(default = "default_sink_max_attempts")]
    pub sink_max_attempts: usize,

    #[serde(default = "default_sink_initial_delay")]
    pub sink_initial_delay: String,

    #[serde(default = "default_sink_max_delay")]
    pub sink_max_delay: String,

    /// Subscribe attempts before giving up. Absent = retry forever.
    #[serde(default)]
    pub reconnect_max_attempts: Option<usize>,

    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay: String,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: String,
}

fn default_sink_max_attempts() -> usize {
    5
}

fn default_sink_initial_delay() -> String {
    "200ms".to_string()
}

fn default_sink_max_delay() -> String {
    "10s".to_string()
}

fn default_reconnect_initial_delay() -> String {
    "1s".to_string()
}

fn default_reconnect_max_delay() -> String {
    "60s".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            sink_max_attempts: default_sink_max_attempts(),
            sink_initial_delay: default_sink_initial_delay(),
            sink_max_delay: default_sink_max_delay(),
            reconnect_max_attempts: None,
            reconnect_initial_delay: default_reconnect_initial_delay(),
            reconnect_max_delay: default_reconnect_max_delay(),
        }
    }
}

impl RetrySettings {
    pub fn for_testing() -> Self {
        Self {
            sink_max_attempts: 3,
            sink_initial_delay: "10ms".to_string(),
            sink_max_delay: "100ms".to_string(),
            reconnect_max_attempts: Some(5),
            reconnect_initial_delay: "10ms".to_string(),
            reconnect_max_delay: "100ms".to_string(),
        }
    }

    /// Backoff for retrying failed destinations.
    pub fn sink_retry(&self) -> RetryConfig {
        let defaults = RetryConfig::sink();
        RetryConfig {
            max_attempts: self.sink_max_attempts,
            initial_delay: humantime::parse_duration(&self.sink_initial_delay)
                .unwrap_or(defaults.initial_delay),
            max_delay: humantime::parse_duration(&self.sink_max_delay).unwrap_or(defaults.max_delay),
            backoff_factor: defaults.backoff_factor,
        }
    }

    /// Backoff for resubscribing to the feed.
    pub fn reconnect_retry(&self) -> RetryConfig {
        let defaults = RetryConfig::reconnect();
        RetryConfig {
            max_attempts: self.reconnect_max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: humantime::parse_duration(&self.reconnect_initial_delay)
                .unwrap_or(defaults.initial_delay),
            max_delay: humantime::parse_duration(&self.reconnect_max_delay)
                .unwrap_or(defaults.max_delay),
            backoff_factor: defaults.backoff_factor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
