#![no_main]

//! Fuzz harness for native messaging frame decoding.
//!
//! Feeds arbitrary byte streams through the length-prefixed decoder the way
//! the port reader does: decode, advance, repeat.

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use tweety::bridge::protocol::{self, MAX_HOST_MESSAGE_BYTES};

const MAX_INPUT_BYTES: usize = 256 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_INPUT_BYTES {
        return;
    }

    let mut rest = data;
    for _ in 0..64 {
        match protocol::decode_frame::<Value>(rest, MAX_HOST_MESSAGE_BYTES) {
            Ok(Some((message, consumed))) => {
                let declared = protocol::frame_length(rest).expect("complete header");
                assert_eq!(consumed, declared + 4);
                assert!(consumed <= rest.len());

                let frame = protocol::encode_frame(&message, MAX_HOST_MESSAGE_BYTES)
                    .expect("decoded message re-encodes");
                assert!(matches!(
                    protocol::decode_frame::<Value>(&frame, MAX_HOST_MESSAGE_BYTES),
                    Ok(Some((_, n))) if n == frame.len()
                ));
                rest = &rest[consumed..];
            }
            Ok(None) | Err(_) => break,
        }
    }
});
