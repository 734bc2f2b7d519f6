#![no_main]

use libfuzzer_sys::fuzz_target;

// Decoding arbitrary bytes must never panic and never over-read; a
// successful decode must re-encode to the identical input.
fuzz_target!(|data: &[u8]| {
    if let Ok(messages) = packbench::container::decode(data) {
        let encoded = packbench::container::encode(&messages).unwrap();
        assert_eq!(encoded, data);
    }
});
