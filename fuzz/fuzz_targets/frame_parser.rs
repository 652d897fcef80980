//! Fuzz target for control frame decoding
//!
//! Arbitrary bytes must decode to a message or an error, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_node::protocol::{ClientMessage, RelayMessage, decode_frame, encode_frame};

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Ok(Some((msg, used))) = decode_frame::<ClientMessage>(rest) {
        // Anything that decodes must encode again
        let frame = encode_frame(&msg).expect("decoded message re-encodes");
        assert!(frame.len() <= used);
        rest = &rest[used..];
    }

    let _ = decode_frame::<RelayMessage>(data);
});
