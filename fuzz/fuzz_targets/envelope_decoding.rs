#![no_main]

//! Stored job payloads are decoded on every attempt; malformed rows must
//! surface as errors, never panics.

use hookrelay_delivery::JobEnvelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(envelope) = JobEnvelope::decode(text) {
        let encoded = envelope.encode().expect("decoded envelope re-encodes");
        let again = JobEnvelope::decode(&encoded).expect("re-encoded envelope decodes");
        assert_eq!(again.payload, envelope.payload);
        let _ = envelope.body();
    }
});
