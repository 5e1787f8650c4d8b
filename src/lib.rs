//! # quota-gate - S3 Gateway with Bucket Quota Admission
//!
//! `quota-gate` serves the S3 protocol (through `s3s`) and gates every
//! storage-consuming operation against a per-bucket byte quota. Confirmed
//! usage comes from an external metering service; bytes written since its
//! last report are tracked in a local in-flight ledger until a
//! reconciliation sweep ages them out.
//!
//! - **Atomic admission**: the quota comparison and the reservation happen
//!   under one per-bucket lock
//! - **Commit/rollback protocol**: a failed or cancelled write releases its
//!   reservation
//! - **Fail-open** by default when metering is unreachable, fail-closed on
//!   request
//! - **Quota control-plane** on `{bucket}?quota=true`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quota_gate::{GatewayBackend, LocalLedger, ManualMetering, QuotaSettings};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), quota_gate::GatewayError> {
//! let settings = QuotaSettings::default();
//! let metering = Arc::new(ManualMetering::new());
//! let ledger = Arc::new(LocalLedger::new(settings.reconciliation_window()));
//! let backend = GatewayBackend::with_quota(metering, ledger, &settings);
//!
//! backend.create_bucket("photos")?;
//! backend.quota_admin().handle(
//!     quota_gate::quota::QuotaVerb::Put,
//!     "photos",
//!     br#"{"quota": 1000}"#,
//! )?;
//!
//! // 1024 bytes do not fit in a 1000 byte quota
//! let denied = backend.put_object("photos", "big.bin", vec![0u8; 1024].into()).await;
//! assert!(denied.unwrap_err().is_quota_exceeded());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod multipart;
pub mod quota;
pub mod route;
pub mod s3_impl;
pub mod utils;

pub use backend::{
    BucketCatalog, GatewayBackend, ObjectVersion, PutResult, StorageState, Versioning,
    NULL_VERSION,
};
pub use config::{FailureMode, MeteringSettings, QuotaSettings};
pub use error::{GatewayError, GatewayResult, QuotaError, QuotaResult};
pub use quota::{
    ActionKind, Admission, AdmissionDecision, AdmissionEvaluator, BucketId, HttpMeteringClient,
    InflightLedger, LocalLedger, ManualMetering, QuotaConfigStore, QuotaMetrics,
    ReconciliationTimer, UsageMetering,
};
pub use route::QuotaRoute;
