//! Fuzz target for slot-name derivation.
//!
//! This tests that `derive_slot_name` never panics, stays within the length
//! cap, and is deterministic for arbitrary origin names (including
//! multi-byte characters around the truncation boundary).

#![no_main]

use apply_engine::negotiate::{derive_slot_name, SLOT_NAME_MAX_BYTES};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, u64, u32, u32, &str)| {
    let (remote_db, local_node, timeline, local_db, origin_name) = data;

    let a = derive_slot_name(remote_db, local_node, timeline, local_db, origin_name);
    let b = derive_slot_name(remote_db, local_node, timeline, local_db, origin_name);

    assert_eq!(a, b);
    assert!(a.len() <= SLOT_NAME_MAX_BYTES);
});
