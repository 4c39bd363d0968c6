//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use change_replicator::event::compare_positions;
use change_replicator::flusher::collapse_by_key;
use change_replicator::sink::WriteOp;
use change_replicator::source::{compute_content_hash, decode_document};
use change_replicator::{ChangeEvent, Position, ReplicationConfig, Replicator};
use common::*;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// =============================================================================
// Position Ordering Properties
// =============================================================================

proptest! {
    #[test]
    fn position_comparison_reflexive(ts in 0u64..u64::MAX, seq in 0u64..1000u64) {
        let id = format!("{}-{}", ts, seq);
        prop_assert_eq!(compare_positions(&id, &id), std::cmp::Ordering::Equal);
    }

    #[test]
    fn position_comparison_antisymmetric(
        ts1 in 0u64..1_000_000_000_000u64,
        seq1 in 0u64..1000u64,
        ts2 in 0u64..1_000_000_000_000u64,
        seq2 in 0u64..1000u64,
    ) {
        let id1 = format!("{}-{}", ts1, seq1);
        let id2 = format!("{}-{}", ts2, seq2);

        prop_assert_eq!(compare_positions(&id1, &id2).reverse(), compare_positions(&id2, &id1));
    }

    #[test]
    fn position_comparison_transitive(
        ts1 in 0u64..1_000_000u64,
        seq1 in 0u64..100u64,
        ts2 in 0u64..1_000_000u64,
        seq2 in 0u64..100u64,
        ts3 in 0u64..1_000_000u64,
        seq3 in 0u64..100u64,
    ) {
        let a = Position::new(format!("{}-{}", ts1, seq1));
        let b = Position::new(format!("{}-{}", ts2, seq2));
        let c = Position::new(format!("{}-{}", ts3, seq3));

        if a < b && b < c {
            prop_assert!(a < c);
        }
        if a > b && b > c {
            prop_assert!(a > c);
        }
    }

    /// Higher timestamp always means later position, whatever the sequence.
    #[test]
    fn position_timestamp_dominates(
        ts1 in 0u64..1_000_000_000_000u64,
        ts2 in 0u64..1_000_000_000_000u64,
        seq1 in 0u64..1000u64,
        seq2 in 0u64..1000u64,
    ) {
        prop_assume!(ts1 != ts2);

        let a = Position::new(format!("{}-{}", ts1, seq1));
        let b = Position::new(format!("{}-{}", ts2, seq2));

        prop_assert_eq!(a < b, ts1 < ts2);
    }

    /// The origin sorts below every real position.
    #[test]
    fn origin_is_minimum(ts in 1u64..u64::MAX, seq in 0u64..1000u64) {
        let p = Position::new(format!("{}-{}", ts, seq));
        prop_assert!(Position::origin() < p);
    }

    /// Arbitrary strings never panic and still compare consistently.
    #[test]
    fn position_comparison_never_panics(a in ".*", b in ".*") {
        let ab = compare_positions(&a, &b);
        let ba = compare_positions(&b, &a);
        prop_assert_eq!(ab.reverse(), ba);
    }
}

// =============================================================================
// Payload Decoding Properties
// =============================================================================

proptest! {
    /// A content hash for different bytes is always rejected.
    #[test]
    fn hash_mismatch_is_rejected(v in any::<i64>(), other in any::<i64>()) {
        prop_assume!(v != other);
        let raw = json!({ "v": v }).to_string();
        let wrong = compute_content_hash(json!({ "v": other }).to_string().as_bytes());

        prop_assert!(decode_document(raw.as_bytes(), Some(wrong.as_str())).is_err());
        prop_assert!(decode_document(raw.as_bytes(), None).is_ok());
    }

    /// Garbage never panics the decoder.
    #[test]
    fn decode_arbitrary_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_document(&data, None);
    }
}

// =============================================================================
// Collapse Properties
// =============================================================================

fn op_strategy() -> impl Strategy<Value = Vec<(u8, bool)>> {
    // (key index, is_delete); position = index in the vector.
    prop::collection::vec((0u8..5, any::<bool>()), 0..40)
}

fn to_ops(script: &[(u8, bool)]) -> Vec<WriteOp> {
    script.iter()
        .enumerate()
        .map(|(i, (key, is_delete))| {
            let key = format!("k{}", key);
            let position = Position::new(format!("{}-0", i + 1));
            if *is_delete {
                WriteOp::Delete { key, position }
            } else {
                WriteOp::Upsert {
                    key,
                    document: json!({ "at": i + 1 }),
                    position,
                }
            }
        })
        .collect()
}

proptest! {
    /// One op per key, and it is the one with the highest position.
    #[test]
    fn collapse_keeps_latest_per_key(script in op_strategy()) {
        let ops = to_ops(&script);

        let mut latest: HashMap<String, WriteOp> = HashMap::new();
        for op in &ops {
            latest.insert(op.key().to_string(), op.clone());
        }

        let collapsed = collapse_by_key(ops);
        prop_assert_eq!(collapsed.len(), latest.len());
        for op in &collapsed {
            prop_assert_eq!(Some(op), latest.get(op.key()));
        }
    }

    /// Shuffling the input does not change what survives.
    #[test]
    fn collapse_independent_of_input_order(script in op_strategy(), seed in any::<u64>()) {
        let ops = to_ops(&script);
        let mut shuffled = ops.clone();
        // Deterministic Fisher-Yates from the seed.
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            shuffled.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let mut a: Vec<WriteOp> = collapse_by_key(ops);
        let mut b: Vec<WriteOp> = collapse_by_key(shuffled);
        a.sort_by(|x, y| x.key().cmp(y.key()));
        b.sort_by(|x, y| x.key().cmp(y.key()));
        prop_assert_eq!(a, b);
    }
}

// =============================================================================
// End-to-end: last write wins, replay idempotency
// =============================================================================

fn events_from(script: &[(u8, bool)]) -> Vec<ChangeEvent> {
    script.iter()
        .enumerate()
        .map(|(i, (key, is_delete))| {
            let ms = i as u64 + 1;
            let dest = if key % 2 == 0 { "db.even" } else { "db.odd" };
            let key = format!("k{}", key);
            if *is_delete {
                delete(ms, dest, &key)
            } else {
                upsert(ms, dest, &key, json!({ "at": ms }))
            }
        })
        .collect()
}

/// Apply events one by one, in order: the source's own final state.
fn model(events: &[ChangeEvent]) -> BTreeMap<(String, String), Value> {
    let mut state = BTreeMap::new();
    for e in events {
        let key = (e.destination.clone(), e.document_key.clone());
        match &e.document {
            Some(doc) => {
                state.insert(key, doc.clone());
            }
            None => {
                state.remove(&key);
            }
        }
    }
    state
}

fn run_to_end(source: ScriptedSource, sink: &Arc<MemorySink>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async {
        let config = ReplicationConfig::for_testing("redis://unused", ":memory:");
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut replicator = Replicator::new(config, source, Arc::clone(sink), store).unwrap();
        replicator.run().await.unwrap();
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Final target state per key equals the source's last write.
    #[test]
    fn target_matches_last_write_by_position(script in op_strategy()) {
        let events = events_from(&script);
        let sink = Arc::new(MemorySink::new());

        run_to_end(ScriptedSource::new(events.clone()), &sink);

        prop_assert_eq!(sink.snapshot(), model(&events));
    }

    /// Replaying the whole feed over an already-replicated target changes nothing.
    #[test]
    fn replay_is_idempotent(script in op_strategy()) {
        let events = events_from(&script);
        let sink = Arc::new(MemorySink::new());

        run_to_end(ScriptedSource::new(events.clone()), &sink);
        let first = sink.snapshot();
        run_to_end(ScriptedSource::new(events), &sink);

        prop_assert_eq!(sink.snapshot(), first);
    }

    /// A disconnect anywhere still converges to the source's final state.
    #[test]
    fn disconnect_anywhere_converges(script in op_strategy(), cut in 0usize..40) {
        let events = events_from(&script);
        prop_assume!(cut <= events.len());
        let sink = Arc::new(MemorySink::new());

        run_to_end(ScriptedSource::new(events.clone()).disconnect_after(cut), &sink);

        prop_assert_eq!(sink.snapshot(), model(&events));
    }
}
