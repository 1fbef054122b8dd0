#![no_main]

use adw_duration::parse_duration;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|s: &str| {
    // Must never panic on arbitrary input; either parses or reports an error.
    let _ = parse_duration(s);
});
