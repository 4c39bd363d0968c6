//! Fuzz target for payload decoding.
//!
//! `decode_document` must never panic, whether the bytes are plain JSON,
//! zstd frames or garbage, with or without an expected hash.

#![no_main]

use change_replicator::source::decode_document;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&[u8], Option<&str>)| {
    let (raw, hash) = data;
    if let Ok(document) = decode_document(raw, hash) {
        assert!(document.is_object());
    }
});
