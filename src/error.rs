//! Error types for quota admission and gateway operations

use thiserror::Error;

/// Quota subsystem result type
pub type QuotaResult<T> = Result<T, QuotaError>;

/// Gateway operation result type
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Quota admission and administration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// Admitting the operation would push the bucket past its quota
    #[error("Quota exceeded for bucket {bucket}: projected {projected} bytes, quota {quota} bytes")]
    QuotaExceeded {
        bucket: String,
        quota: u64,
        projected: i64,
    },

    /// Quota value rejected by the control plane
    #[error("{0}")]
    InvalidQuotaConfig(String),

    /// Control-plane payload is not a well-formed object
    #[error("{0}")]
    MalformedRequest(String),

    /// Bucket does not exist
    #[error("Bucket does not exist: {0}")]
    NoSuchBucket(String),

    /// Bucket has no quota configured
    #[error("The bucket does not have a quota: {0}")]
    NoSuchQuota(String),

    /// Metering service unreachable, unhealthy, timed out or stale.
    /// Only surfaced to callers in fail-closed mode.
    #[error("Metering service unavailable: {0}")]
    MeteringUnavailable(String),

    /// Ledger bookkeeping mismatch (unknown or already resolved handle)
    #[error("Ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    /// Admitted operation did not finish within the operation timeout
    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),

    /// Invalid quota settings
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl QuotaError {
    /// Message used when a quota value is not a positive integer
    pub const NON_POSITIVE_QUOTA: &'static str = "Quota Value should be a positive number";

    /// Message used when a quota payload is not a JSON object
    pub const NOT_A_JSON_OBJECT: &'static str = "Request body must be a JSON object";

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, QuotaError::QuotaExceeded { .. })
    }
}

/// S3-facing gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bucket does not exist
    #[error("Bucket does not exist: {0}")]
    NoSuchBucket(String),

    /// Object does not exist
    #[error("Object does not exist: {0}")]
    NoSuchKey(String),

    /// Object version does not exist
    #[error("Version does not exist: {0}")]
    NoSuchVersion(String),

    /// Multipart upload does not exist
    #[error("Upload does not exist: {0}")]
    NoSuchUpload(String),

    /// Bucket already exists
    #[error("Bucket already exists: {0}")]
    BucketAlreadyExists(String),

    /// Invalid bucket name
    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),

    /// Invalid object key
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// Bucket is not empty (cannot delete)
    #[error("Bucket not empty: {0}")]
    BucketNotEmpty(String),

    /// Multipart upload parts are missing or out of sequence
    #[error("Invalid part: {0}")]
    InvalidPart(String),

    /// Operation refused by object lock (retention or legal hold)
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Object is not in a state that allows the operation
    #[error("Invalid object state: {0}")]
    InvalidObjectState(String),

    /// Object or upload changed between delta computation and the write
    #[error("Conflicting concurrent update: {0}")]
    Conflict(String),

    /// Quota admission failure
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, GatewayError::Quota(e) if e.is_quota_exceeded())
    }
}
