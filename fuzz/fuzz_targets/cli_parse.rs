#![no_main]

use libfuzzer_sys::fuzz_target;

// The argument parser must reject garbage gracefully, never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let args: Vec<String> = text.split('\n').map(str::to_owned).collect();
    packbench::cli::fuzz_try_parse_args(&args);
});
