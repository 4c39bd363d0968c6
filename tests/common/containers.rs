// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides a Redis container plus a writer that produces change-feed
//! entries in the format `RedisStreamSource` consumes.

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const TEST_STREAM: &str = "cdc";

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis container acting as the change-feed producer.
pub struct TestFeed<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestFeed<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self { container, redis_url }
    }

    async fn connection(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Append a raw entry to the feed.
    pub async fn add_entry(&self, fields: &[(&str, &[u8])]) -> redis::RedisResult<String> {
        let mut conn = self.connection().await?;
        conn.xadd(TEST_STREAM, "*", fields).await
    }

    /// Append an update carrying `json` as the full document, with its hash.
    pub async fn add_upsert(&self, ns: &str, key: &str, json: &str) -> redis::RedisResult<String> {
        let hash = change_replicator::source::compute_content_hash(json.as_bytes());
        self.add_entry(&[
            ("op", "update".as_bytes()),
            ("ns", ns.as_bytes()),
            ("key", key.as_bytes()),
            ("doc", json.as_bytes()),
            ("hash", hash.as_bytes()),
        ])
        .await
    }

    /// Append an update whose document is zstd-compressed.
    pub async fn add_compressed_upsert(&self, ns: &str, key: &str, json: &str) -> redis::RedisResult<String> {
        let compressed = zstd::encode_all(json.as_bytes(), 3)
            .map_err(|e| redis::RedisError::from((redis::ErrorKind::IoError, "zstd", e.to_string())))?;
        self.add_entry(&[
            ("op", "insert".as_bytes()),
            ("ns", ns.as_bytes()),
            ("key", key.as_bytes()),
            ("doc", compressed.as_slice()),
        ])
        .await
    }

    pub async fn add_delete(&self, ns: &str, key: &str) -> redis::RedisResult<String> {
        self.add_entry(&[("op", "delete".as_bytes()), ("ns", ns.as_bytes()), ("key", key.as_bytes())])
            .await
    }

    pub async fn stream_len(&self) -> redis::RedisResult<usize> {
        let mut conn = self.connection().await?;
        conn.xlen(TEST_STREAM).await
    }

    /// Trim the stream to its newest `keep` entries.
    pub async fn trim_to(&self, keep: usize) -> redis::RedisResult<()> {
        let mut conn = self.connection().await?;
        let _: usize = redis::cmd("XTRIM")
            .arg(TEST_STREAM)
            .arg("MAXLEN")
            .arg(keep)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
