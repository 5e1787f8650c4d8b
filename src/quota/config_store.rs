//! Per-bucket quota configuration storage
//!
//! A quota lives on the bucket's metadata record. Absence of a quota means
//! the bucket is unlimited.

use crate::error::{QuotaError, QuotaResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Quota limit attached to a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketQuotaConfig {
    pub bucket_name: String,
    pub quota_bytes: u64,
}

/// Persistence for bucket quota limits
///
/// Implementations store the limit alongside the rest of the bucket's
/// metadata. `set_quota` overwrites; there is no merge.
pub trait QuotaConfigStore: Send + Sync {
    /// Set or replace the bucket's quota
    fn set_quota(&self, bucket: &str, quota_bytes: u64) -> QuotaResult<()>;

    /// Get the bucket's quota, `None` when unlimited
    fn get_quota(&self, bucket: &str) -> QuotaResult<Option<BucketQuotaConfig>>;

    /// Remove the bucket's quota; succeeds when none is set
    fn delete_quota(&self, bucket: &str) -> QuotaResult<()>;
}

/// Reject zero quotas
pub fn validate_quota_bytes(quota_bytes: u64) -> QuotaResult<u64> {
    if quota_bytes == 0 {
        return Err(QuotaError::InvalidQuotaConfig(
            QuotaError::NON_POSITIVE_QUOTA.to_string(),
        ));
    }
    Ok(quota_bytes)
}

/// Parse a control-plane payload of the form `{"quota": <bytes>}`
///
/// Integer strings are accepted (`{"quota": "1000"}`). Anything that is not a
/// JSON object is `MalformedRequest`; a missing, fractional, negative or zero
/// value is `InvalidQuotaConfig`.
pub fn parse_quota_payload(body: &[u8]) -> QuotaResult<u64> {
    let malformed = || QuotaError::MalformedRequest(QuotaError::NOT_A_JSON_OBJECT.to_string());
    let invalid = || QuotaError::InvalidQuotaConfig(QuotaError::NON_POSITIVE_QUOTA.to_string());

    let value: Value = serde_json::from_slice(body).map_err(|_| malformed())?;
    let object = value.as_object().ok_or_else(malformed)?;

    let quota = match object.get("quota") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };

    quota.ok_or_else(invalid).and_then(validate_quota_bytes)
}

/// Standalone in-memory quota store
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    quotas: RwLock<HashMap<String, u64>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaConfigStore for MemoryQuotaStore {
    fn set_quota(&self, bucket: &str, quota_bytes: u64) -> QuotaResult<()> {
        let quota_bytes = validate_quota_bytes(quota_bytes)?;
        self.quotas.write().insert(bucket.to_string(), quota_bytes);
        Ok(())
    }

    fn get_quota(&self, bucket: &str) -> QuotaResult<Option<BucketQuotaConfig>> {
        Ok(self
            .quotas
            .read()
            .get(bucket)
            .map(|&quota_bytes| BucketQuotaConfig {
                bucket_name: bucket.to_string(),
                quota_bytes,
            }))
    }

    fn delete_quota(&self, bucket: &str) -> QuotaResult<()> {
        self.quotas.write().remove(bucket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_payloads() {
        assert_eq!(parse_quota_payload(br#"{"quota": 1000}"#).unwrap(), 1000);
        assert_eq!(parse_quota_payload(br#"{"quota": "2048"}"#).unwrap(), 2048);
        assert_eq!(
            parse_quota_payload(br#"{"quota": 1, "extra": true}"#).unwrap(),
            1
        );
    }

    #[test]
    fn test_parse_non_positive() {
        for body in [
            &br#"{"quota": 0}"#[..],
            br#"{"quota": -5}"#,
            br#"{"quota": 1.5}"#,
            br#"{"quota": "abc"}"#,
            br#"{"quota": null}"#,
            br#"{}"#,
        ] {
            let err = parse_quota_payload(body).unwrap_err();
            assert_eq!(
                err,
                QuotaError::InvalidQuotaConfig(QuotaError::NON_POSITIVE_QUOTA.to_string()),
                "body: {}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_parse_malformed() {
        for body in [&b"not json"[..], b"", b"[1, 2]", b"42", br#""quota""#] {
            let err = parse_quota_payload(body).unwrap_err();
            assert!(matches!(err, QuotaError::MalformedRequest(_)));
        }
    }

    #[test]
    fn test_memory_store_overwrite_and_delete() {
        let store = MemoryQuotaStore::new();
        assert_eq!(store.get_quota("bucket").unwrap(), None);

        store.set_quota("bucket", 1000).unwrap();
        store.set_quota("bucket", 500).unwrap();
        assert_eq!(store.get_quota("bucket").unwrap().unwrap().quota_bytes, 500);

        store.delete_quota("bucket").unwrap();
        assert_eq!(store.get_quota("bucket").unwrap(), None);

        // Deleting again is not an error
        store.delete_quota("bucket").unwrap();
    }

    #[test]
    fn test_memory_store_rejects_zero() {
        let store = MemoryQuotaStore::new();
        assert!(matches!(
            store.set_quota("bucket", 0),
            Err(QuotaError::InvalidQuotaConfig(_))
        ));
        assert_eq!(store.get_quota("bucket").unwrap(), None);
    }

    #[test]
    fn test_config_serializes_camel_case() {
        let config = BucketQuotaConfig {
            bucket_name: "b".to_string(),
            quota_bytes: 10,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"bucketName":"b","quotaBytes":10}"#);
    }
}
