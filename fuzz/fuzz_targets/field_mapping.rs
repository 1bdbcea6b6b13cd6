#![no_main]

//! Feeds arbitrary payloads and mappings through the transformer's path
//! engine. Input is split on the first NUL byte: the payload JSON first,
//! then a mapping JSON. Any panic is a bug.

use hookrelay_core::models::FieldMapping;
use hookrelay_delivery::transform::{
    apply_mapping, collapse_index_maps, flatten, get_by_path, set_by_path,
};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let (payload, mapping) = match data.iter().position(|b| *b == 0) {
        Some(split) => (&data[..split], &data[split + 1..]),
        None => (data, &[][..]),
    };

    let Ok(payload) = serde_json::from_slice::<Value>(payload) else {
        return;
    };
    let mapping = serde_json::from_slice::<FieldMapping>(mapping).unwrap_or_default();

    let mapped = apply_mapping(&payload, &mapping);
    assert!(mapped.is_object());

    let mut rebuilt = Value::Null;
    for (path, value) in flatten(&payload) {
        assert!(get_by_path(&payload, &path).is_some());
        set_by_path(&mut rebuilt, &path, value);
    }
    collapse_index_maps(&mut rebuilt);

    for rule in &mapping.mappings {
        let mut scratch = mapped.clone();
        set_by_path(&mut scratch, &rule.target, Value::Bool(true));
    }
});
