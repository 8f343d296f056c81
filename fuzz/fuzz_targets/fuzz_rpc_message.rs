#![no_main]

//! Fuzz harness for JSON-RPC message classification.
//!
//! Exercises the shape checks applied to every message crossing the relay
//! and the native port, plus response parsing.

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use tweety::bridge::protocol::{self, RpcMessage, RpcResponse};

const MAX_INPUT_BYTES: usize = 128 * 1024;

fn fuzz_json(input: &str) {
    let Ok(value) = serde_json::from_str::<Value>(input) else {
        return;
    };

    let _ = protocol::is_request(&value);
    if protocol::is_response(&value) {
        if let Some(parsed) = RpcResponse::from_value(value.clone()) {
            assert!(
                protocol::is_response(&parsed.to_value()),
                "parsed response must serialize back to a valid response"
            );
        }
    }

    let _ = RpcMessage::classify(value);
}

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > MAX_INPUT_BYTES {
        return;
    }

    let lossy = String::from_utf8_lossy(data);
    fuzz_json(&lossy);

    for line in lossy.lines().take(256) {
        fuzz_json(line.trim_end_matches('\r'));
    }
});
