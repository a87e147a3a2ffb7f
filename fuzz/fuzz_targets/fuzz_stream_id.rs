//! Fuzz target for stream ID comparison logic.
//!
//! Comparison must never panic on arbitrary input and stays antisymmetric,
//! since the tailer and checkpoint store both rely on it to order positions.

#![no_main]

use artifact_replication::stream::compare_stream_ids;
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_stream_ids(a, b);
    let ba = compare_stream_ids(b, a);
    assert_eq!(ab, ba.reverse());

    assert_eq!(compare_stream_ids(a, a), Ordering::Equal);
});
