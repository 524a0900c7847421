//! Fuzz target for stream frame parsing.
//!
//! This tests that `StreamMessage::parse` and the frame splitter never
//! panic on arbitrary input.

#![no_main]

use apply_engine::protocol::{take_frame, StreamMessage};
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Should never panic, whatever the tag or length.
    let _ = StreamMessage::parse(data);

    // Arbitrary bytes through the frame splitter: either frames pop out or
    // it reports a corrupt length, but it never panics.
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = take_frame(&mut buf) {
        let _ = StreamMessage::parse(&frame);
    }
});
