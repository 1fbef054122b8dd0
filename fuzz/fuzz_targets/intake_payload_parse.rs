#![no_main]

use adw::webhook::IntakePayload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The intake route runs this deserialization directly on the raw,
    // signature-verified request body; it must never panic on untrusted
    // bytes, only return a typed decode error.
    let _ = serde_json::from_slice::<IntakePayload>(data);
});
