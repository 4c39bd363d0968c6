// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event Source integration.
//!
//! An Event Source is an ordered, resumable feed of [`ChangeEvent`]s. The
//! Replicator subscribes once per connection attempt and then pulls events
//! one at a time:
//!
//! ```text
//! subscribe(After(checkpoint)) ──▶ next_event() ──▶ next_event() ──▶ ...
//!        │                               │
//!        ▼                               ▼
//!  StreamTrimmed ──▶ data gap,     TransientFeed ──▶ reconnect at checkpoint
//!  resume at Earliest              MalformedEvent ──▶ skip, keep reading
//! ```
//!
//! # Payload Decoding
//!
//! Adapters carry documents as bytes. [`decode_document`] handles the two
//! encodings the feed may use: optional zstd compression (detected by magic
//! bytes) and an optional SHA-256 content hash, verified after
//! decompression so corruption in transit surfaces as a malformed event
//! instead of a bad write.

pub mod stream;

pub use stream::{RedisSourceConfig, RedisStreamSource};

use crate::error::BoxFuture;
use crate::event::{ChangeEvent, Position};
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Where a subscription starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeFrom {
    /// Strictly after this position (resume from a checkpoint).
    After(Position),
    /// From the oldest event the source still retains.
    Earliest,
    /// Only events produced after subscribing.
    Latest,
}

impl std::fmt::Display for SubscribeFrom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscribeFrom::After(p) => write!(f, "after {}", p),
            SubscribeFrom::Earliest => f.write_str("earliest"),
            SubscribeFrom::Latest => f.write_str("latest"),
        }
    }
}

/// Trait defining what the Replicator needs from the change feed.
///
/// Owned exclusively by the consuming loop, hence `&mut self`.
pub trait EventSource: Send + 'static {
    /// Open (or reopen) the feed.
    ///
    /// Returns the concrete position the feed resumes after: the given
    /// position for `After`, the origin for `Earliest`, the newest retained
    /// position for `Latest`. Fails with `StreamTrimmed` when `After` names a
    /// position the source no longer retains.
    fn subscribe(&mut self, from: SubscribeFrom) -> BoxFuture<'_, Position>;

    /// Wait for the next event.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose an event. `Ok(None)` means the feed has ended.
    /// `Err(MalformedEvent)` reports one skipped event; reading may continue.
    fn next_event(&mut self) -> BoxFuture<'_, Option<ChangeEvent>>;
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data).map_err(|e| format!("zstd init: {}", e))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| format!("zstd decode: {}", e))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Decode a raw document payload into JSON.
///
/// The hash, when present, is checked against the decompressed bytes.
pub fn decode_document(
    raw: &[u8],
    expected_hash: Option<&str>,
) -> std::result::Result<serde_json::Value, String> {
    let data = maybe_decompress(raw)?;

    if let Some(expected) = expected_hash {
        let computed = compute_content_hash(&data);
        if !computed.eq_ignore_ascii_case(expected) {
            return Err(format!(
                "content hash mismatch: expected {}, got {}",
                expected, computed
            ));
        }
    }

    let document: serde_json::Value =
        serde_json::from_slice(&data).map_err(|e| format!("document is not JSON: {}", e))?;
    if !document.is_object() {
        return Err("document is not a JSON object".to_string());
    }
    Ok(document)
}
