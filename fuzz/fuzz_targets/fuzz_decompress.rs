//! Fuzz target for payload decoding.
//!
//! `maybe_decompress`, `decode_task` and `peek_identity` must never panic on
//! arbitrary input.

#![no_main]

use history_replicator::history::RawReplicationTask;
use history_replicator::source::codec::{decode_task, maybe_decompress, peek_identity};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);

    let raw = RawReplicationTask::new("fuzz", 1, data.to_vec());
    let _ = peek_identity(&raw);
    let _ = decode_task(&raw);
});
