#![no_main]

use libfuzzer_sys::fuzz_target;
use wsocket::{extract_discriminant, FieldPath};

fuzz_target!(|data: &[u8]| {
    // First line is the field path, the rest is the payload.
    let (path, payload) = match data.iter().position(|&b| b == b'\n') {
        Some(split) => data.split_at(split),
        None => (&b"type"[..], data),
    };
    let path = FieldPath::new(String::from_utf8_lossy(path).into_owned());

    if let Ok(discriminant) = extract_discriminant(payload, &path) {
        // A found discriminant always comes from valid JSON.
        assert!(serde_json::from_slice::<serde_json::Value>(payload).is_ok());
        let _ = discriminant.len();
    }
});
