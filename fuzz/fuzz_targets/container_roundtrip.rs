#![no_main]

use libfuzzer_sys::fuzz_target;

use packbench::container::{Message, decode, encode};

// Build messages from fuzzer-chosen name/payload splits and check the
// encode/decode round trip is lossless.
fuzz_target!(|data: &[u8]| {
    let mut messages = Vec::new();
    for chunk in data.chunks(257) {
        let split = (chunk.first().copied().unwrap_or(0) as usize).min(chunk.len());
        let Ok(name) = std::str::from_utf8(&chunk[..split]) else {
            continue;
        };
        let payload = chunk[split..].to_vec();
        match Message::new(name, payload) {
            Ok(message) => messages.push(message),
            Err(_) => return,
        }
    }

    let encoded = encode(&messages).unwrap();
    let decoded = decode(&encoded).unwrap();
    assert_eq!(decoded, messages);
});
