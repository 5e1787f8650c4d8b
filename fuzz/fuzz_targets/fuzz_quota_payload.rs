#![no_main]
use libfuzzer_sys::fuzz_target;
use quota_gate::quota::parse_quota_payload;
use quota_gate::QuotaError;

// Arbitrary request bodies never panic and never yield a zero quota
fuzz_target!(|data: &[u8]| {
    match parse_quota_payload(data) {
        Ok(quota) => assert!(quota > 0),
        Err(QuotaError::InvalidQuotaConfig(_)) | Err(QuotaError::MalformedRequest(_)) => {}
        Err(other) => panic!("unexpected error: {:?}", other),
    }
});
