#![no_main]

use std::fs;

use adw::state_store::{RunStateStore, STATE_FILE};
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let Ok(td) = tempdir() else { return };
    let run_dir = td.path().join("agents").join("fuzz-run");
    if fs::create_dir_all(&run_dir).is_err() {
        return;
    }
    if fs::write(run_dir.join(STATE_FILE), data).is_err() {
        return;
    }

    let store = RunStateStore::new(td.path().join("agents"));
    // Arbitrary file contents must surface a typed error, never panic.
    let _ = store.load("fuzz-run");
});
