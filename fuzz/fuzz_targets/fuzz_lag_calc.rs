//! Fuzz target for lag calculation.
//!
//! `lag_ms_since` and `parse_stream_id_timestamp` must never panic, and a
//! parsed timestamp must agree with the lag it produces.

#![no_main]

use artifact_replication::stream::{lag_ms_since, parse_stream_id_timestamp};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u64)| {
    let (id, now_ms) = data;

    let ts = parse_stream_id_timestamp(id);
    let lag = lag_ms_since(id, now_ms);
    assert_eq!(lag, ts.map(|ts| now_ms.saturating_sub(ts)));
});
