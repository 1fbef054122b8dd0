#![no_main]

use adw_types::RunStateDocument;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(doc) = serde_json::from_str::<RunStateDocument>(s) {
        let Ok(again) = serde_json::to_string(&doc) else {
            return;
        };
        let Ok(roundtripped) = serde_json::from_str::<RunStateDocument>(&again) else {
            return;
        };
        assert_eq!(doc.run_id, roundtripped.run_id);
        assert_eq!(doc.workflow_template, roundtripped.workflow_template);
        assert_eq!(doc.plan_file_path, roundtripped.plan_file_path);
        assert_eq!(doc.pr_url, roundtripped.pr_url);

        // The Run State Document never carries coordination state.
        let value = serde_json::to_value(&doc).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("status"));
        assert!(!obj.contains_key("current_phase"));
    }
});
