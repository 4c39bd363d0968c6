//! Fuzz target for position comparison.
//!
//! Comparison must never panic on arbitrary tokens and must stay a total
//! order consistent with equality.

#![no_main]

use change_replicator::event::{compare_positions, parse_position_millis};
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_positions(a, b);
    let ba = compare_positions(b, a);
    assert_eq!(ab, ba.reverse());

    assert_eq!(compare_positions(a, a), Ordering::Equal);
    if ab == Ordering::Equal {
        assert_eq!(a, b);
    }

    let _ = parse_position_millis(a);
});
