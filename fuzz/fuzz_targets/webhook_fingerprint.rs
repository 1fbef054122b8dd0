#![no_main]

use adw_types::webhook_fingerprint;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str, &str, &str)| {
    let (source, run_id, status, queue_id) = data;

    let a = webhook_fingerprint(source, run_id, status, queue_id);
    let b = webhook_fingerprint(source, run_id, status, queue_id);
    // Deterministic: the same quadruple always hashes to the same fingerprint.
    assert_eq!(a, b);
    // Always a lowercase-hex SHA-256 digest.
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
});
