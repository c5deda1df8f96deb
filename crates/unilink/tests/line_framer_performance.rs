//! Scenario F: 50,000 one-byte pushes followed by a single delimiter push;
//! the framer emits exactly one 50,000-byte message, and feeding all those
//! single-byte chunks stays well under the quadratic-behavior guard.

use std::time::Instant;

use unilink::framer::{Framer, LineFramer};

#[test]
fn fifty_thousand_single_byte_pushes_stay_linear_and_emit_one_message() {
    let mut framer = LineFramer::new(b"\n", false, 10 * 1024 * 1024);
    let payload: Vec<u8> = (0..50_000).map(|i| b'a' + (i % 26) as u8).collect();

    let start = Instant::now();
    let mut messages: Vec<Vec<u8>> = Vec::new();
    for &byte in &payload {
        framer.push_bytes(&[byte], &mut |msg| messages.push(msg.to_vec()));
    }
    framer.push_bytes(b"\n", &mut |msg| messages.push(msg.to_vec()));
    let elapsed = start.elapsed();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].len(), 50_000);
    assert_eq!(messages[0], payload);
    assert!(elapsed.as_millis() < 500, "framing took {elapsed:?}, suspect quadratic behavior");
}
