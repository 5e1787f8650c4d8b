//! Quota admission control
//!
//! Every storage-consuming operation passes through [`AdmissionEvaluator`],
//! which combines three narrow collaborators:
//!
//! - [`QuotaConfigStore`]: the bucket's configured limit
//! - [`UsageMetering`]: confirmed usage from the external metering service
//! - [`InflightLedger`]: process-local deltas the metering service has not
//!   observed yet
//!
//! A [`ReconciliationTimer`] ages committed ledger entries out once the
//! metering service is presumed to have absorbed them.
//!
//! ```text
//! caller ── evaluate(bucket, delta, action) ──► Admission ──► write ──► commit / rollback
//!                 │            │         │
//!            quota store   metering   ledger ◄── reconciliation sweep
//! ```

pub mod admin;
pub mod config_store;
pub mod delta;
pub mod evaluator;
pub mod ledger;
pub mod metering;
pub mod monitoring;
pub mod reconcile;

pub use admin::{is_quota_request, QuotaAdmin, QuotaReply, QuotaVerb};
pub use config_store::{
    parse_quota_payload, validate_quota_bytes, BucketQuotaConfig, MemoryQuotaStore,
    QuotaConfigStore,
};
pub use delta::{bytes_to_write, WriteSizes};
pub use evaluator::{
    ActionKind, Admission, AdmissionDecision, AdmissionEvaluator, DecisionReason, RestoreMarker,
};
pub use ledger::{EntryHandle, EntryState, FlushStats, InflightEntry, InflightLedger, LocalLedger, Overdraft};
pub use metering::{Health, HttpMeteringClient, ManualMetering, UsageMetering, UsageSnapshot};
pub use monitoring::QuotaMetrics;
pub use reconcile::ReconciliationTimer;

use chrono::{DateTime, Utc};
use std::fmt;

/// Identity of a bucket as seen by the quota subsystem
///
/// The metering service keys usage by name and creation date so that a
/// re-created bucket starts from zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketId {
    name: String,
    created_at: DateTime<Utc>,
}

impl BucketId {
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        BucketId {
            name: name.into(),
            created_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Key used in metering service URLs: `{name}_{creation millis}`
    pub fn metering_key(&self) -> String {
        format!("{}_{}", self.name, self.created_at.timestamp_millis())
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_metering_key() {
        let created = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let id = BucketId::new("bucketName", created);
        assert_eq!(id.metering_key(), "bucketName_1640995200000");
        assert_eq!(id.to_string(), "bucketName");
    }

    #[test]
    fn test_recreated_bucket_gets_new_key() {
        let first = BucketId::new("b", Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let second = BucketId::new("b", Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        assert_ne!(first.metering_key(), second.metering_key());
    }
}
