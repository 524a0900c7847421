//! Fuzz target for control response decoding.
//!
//! This tests that `ControlResponse::decode` never panics on arbitrary
//! input, and that anything it accepts re-encodes to the same value.

#![no_main]

use apply_engine::protocol::ControlResponse;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(resp) = ControlResponse::decode(data) {
        let reencoded = resp.encode();
        let again = ControlResponse::decode(&reencoded).expect("re-encoded response must decode");
        assert_eq!(again, resp);
    }
});
