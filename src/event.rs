// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire-independent change event model.
//!
//! A [`ChangeEvent`] is one mutation observed on the source store. Sources
//! validate their wire format into this shape at the feed boundary; nothing
//! downstream deals with raw stream fields.
//!
//! # Positions
//!
//! A [`Position`] is an opaque, totally ordered token. The adapters shipped
//! with this crate use Redis stream IDs (`{millis}-{sequence}`), which are
//! compared numerically, not lexicographically:
//!
//! ```text
//! "0" < "9-0" < "10-0" < "10-1"
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Opaque, totally ordered resume token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    /// The origin position. Compares below every real position.
    pub const ORIGIN: &'static str = "0";

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn origin() -> Self {
        Self(Self::ORIGIN.to_string())
    }

    pub fn is_origin(&self) -> bool {
        self.0 == Self::ORIGIN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond component of the token, if it has one.
    pub fn millis(&self) -> Option<u64> {
        parse_position_millis(&self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_positions(&self.0, &other.0)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two position tokens.
///
/// Tokens are `{millis}-{sequence}`; both parts are compared numerically.
/// Tokens that compare numerically equal but differ textually (leading
/// zeros, malformed input) fall back to byte order so the ordering stays
/// total and consistent with equality.
pub fn compare_positions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> (u64, u64) {
        match s.split_once('-') {
            Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            // "0" (origin) or malformed
            None => (s.parse().unwrap_or(0), 0),
        }
    };

    let (a_ts, a_seq) = parse(a);
    let (b_ts, b_seq) = parse(b);

    a_ts.cmp(&b_ts)
        .then(a_seq.cmp(&b_seq))
        .then_with(|| a.cmp(b))
}

/// Parse the millisecond component from a position token.
///
/// Returns `None` for malformed tokens and for the origin `"0"`.
pub fn parse_position_millis(token: &str) -> Option<u64> {
    let (ts, seq) = token.split_once('-')?;
    seq.parse::<u64>().ok()?;
    ts.parse().ok()
}

/// Kind of mutation carried by a change event.
///
/// Schema and admin events are filtered out upstream; only document
/// mutations reach the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Some(Self::Insert),
            "update" | "replace" => Some(Self::Update),
            "delete" | "del" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Whether events of this kind must carry the full document.
    pub fn requires_document(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation from the source's change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Resume token of this event.
    pub position: Position,
    /// Source-side commit time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Destination namespace (collection or table), e.g. `"shop.orders"`.
    pub destination: String,
    pub operation: OperationKind,
    /// Identifier unique within `destination`.
    pub document_key: String,
    /// Full current document state. `None` for deletes.
    pub document: Option<serde_json::Value>,
}

impl ChangeEvent {
    /// Build an insert/update event carrying the full document.
    pub fn upsert(
        position: Position,
        timestamp: i64,
        destination: impl Into<String>,
        operation: OperationKind,
        document_key: impl Into<String>,
        document: serde_json::Value,
    ) -> Self {
        Self {
            position,
            timestamp,
            destination: destination.into(),
            operation,
            document_key: document_key.into(),
            document: Some(document),
        }
    }

    /// Build a delete event.
    pub fn delete(
        position: Position,
        timestamp: i64,
        destination: impl Into<String>,
        document_key: impl Into<String>,
    ) -> Self {
        Self {
            position,
            timestamp,
            destination: destination.into(),
            operation: OperationKind::Delete,
            document_key: document_key.into(),
            document: None,
        }
    }

    /// Check the fixed-shape invariants.
    ///
    /// Returns the reason the event is malformed, if it is.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.position.is_origin() {
            return Err("position must not be the origin".to_string());
        }
        if self.destination.is_empty() {
            return Err("missing destination".to_string());
        }
        if self.document_key.is_empty() {
            return Err("missing document key".to_string());
        }
        match (self.operation.requires_document(), self.document.is_some()) {
            (true, false) => Err(format!("{} without full document", self.operation)),
            (false, true) => Err("delete carries a document".to_string()),
            _ => Ok(()),
        }
    }

    /// Approximate in-memory footprint, used for the pending-bytes cap.
    pub fn approximate_size(&self) -> usize {
        let document = self
            .document
            .as_ref()
            .map(|d| serde_json::to_vec(d).map(|v| v.len()).unwrap_or(0))
            .unwrap_or(0);
        self.position.as_str().len() + self.destination.len() + self.document_key.len() + document
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_numeric_ordering() {
        assert!(Position::new("9-0") < Position::new("10-0"));
        assert!(Position::new("10-0") < Position::new("10-1"));
        assert!(Position::new("10-2") < Position::new("11-0"));
        assert_eq!(Position::new("10-1"), Position::new("10-1"));
    }

    #[test]
    fn test_origin_is_lowest() {
        assert!(Position::origin() < Position::new("0-1"));
        assert!(Position::origin() < Position::new("1700000000000-0"));
        assert!(Position::origin().is_origin());
    }

    #[test]
    fn test_compare_is_total_for_textual_variants() {
        // Numerically equal, textually different: still ordered, never Equal.
        assert_ne!(compare_positions("010-0", "10-0"), Ordering::Equal);
        assert_eq!(
            compare_positions("010-0", "10-0"),
            compare_positions("10-0", "010-0").reverse()
        );
    }

    #[test]
    fn test_parse_position_millis() {
        assert_eq!(parse_position_millis("1700000000123-4"), Some(1_700_000_000_123));
        assert_eq!(parse_position_millis("0"), None);
        assert_eq!(parse_position_millis("abc-def"), None);
        assert_eq!(Position::new("5-0").millis(), Some(5));
    }

    #[test]
    fn test_operation_kind_parse() {
        assert_eq!(OperationKind::parse("insert"), Some(OperationKind::Insert));
        assert_eq!(OperationKind::parse("UPDATE"), Some(OperationKind::Update));
        assert_eq!(OperationKind::parse("replace"), Some(OperationKind::Update));
        assert_eq!(OperationKind::parse("delete"), Some(OperationKind::Delete));
        assert_eq!(OperationKind::parse("drop"), None);
        assert_eq!(OperationKind::parse("invalidate"), None);
    }

    #[test]
    fn test_validate_upsert_requires_document() {
        let mut event = ChangeEvent::upsert(
            Position::new("1-0"),
            1,
            "shop.orders",
            OperationKind::Insert,
            "order-1",
            json!({"_id": "order-1"}),
        );
        assert!(event.validate().is_ok());

        event.document = None;
        let reason = event.validate().unwrap_err();
        assert!(reason.contains("insert"));
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let event = ChangeEvent::delete(Position::new("1-0"), 1, "", "k");
        assert_eq!(event.validate().unwrap_err(), "missing destination");

        let event = ChangeEvent::delete(Position::new("1-0"), 1, "shop.orders", "");
        assert_eq!(event.validate().unwrap_err(), "missing document key");

        let event = ChangeEvent::delete(Position::origin(), 1, "shop.orders", "k");
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_delete_with_document_is_malformed() {
        let mut event = ChangeEvent::delete(Position::new("1-0"), 1, "shop.orders", "k");
        event.document = Some(json!({}));
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_approximate_size_counts_document() {
        let small = ChangeEvent::delete(Position::new("1-0"), 1, "a.b", "k");
        let large = ChangeEvent::upsert(
            Position::new("1-0"),
            1,
            "a.b",
            OperationKind::Update,
            "k",
            json!({"payload": "x".repeat(1000)}),
        );
        assert!(large.approximate_size() > small.approximate_size() + 1000);
    }

    #[test]
    fn test_event_serde_roundtrip_shape() {
        let event = ChangeEvent::upsert(
            Position::new("1-0"),
            42,
            "shop.orders",
            OperationKind::Insert,
            "order-1",
            json!({"total": 10}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["position"], "1-0");
        assert_eq!(json["operation"], "insert");
    }
}
