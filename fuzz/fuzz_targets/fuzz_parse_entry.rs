//! Fuzz target for stream entry parsing.
//!
//! Any accepted entry must produce an event that passes validation.

#![no_main]

use change_replicator::source::stream::parse_entry;
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

fuzz_target!(|data: (&str, Vec<(String, Vec<u8>)>)| {
    let (id, pairs) = data;
    let fields: HashMap<String, redis::Value> = pairs
        .into_iter()
        .map(|(k, v)| (k, redis::Value::BulkString(v)))
        .collect();

    if let Ok(event) = parse_entry(id, &fields) {
        assert!(event.validate().is_ok());
    }
});
