//! Admission evaluation
//!
//! Per request:
//!
//! ```text
//! Idle ─► Evaluating ─┬─► Denied
//!                     └─► Admitted ─┬─► Committed
//!                                   └─► RolledBack
//! ```
//!
//! The check against the quota and the ledger reservation happen under the
//! bucket's ledger lock, so concurrent writers to one bucket cannot both be
//! admitted past the limit.

use crate::config::{FailureMode, QuotaSettings};
use crate::error::{QuotaError, QuotaResult};
use crate::quota::config_store::QuotaConfigStore;
use crate::quota::ledger::{EntryHandle, InflightLedger};
use crate::quota::metering::{Health, UsageMetering};
use crate::quota::monitoring::{QuotaMetrics, REASON_FAIL_CLOSED, REASON_FAIL_OPEN};
use crate::quota::BucketId;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Mutating operation being gated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    PutObject,
    CopyObject,
    UploadPart,
    UploadPartCopy,
    CompleteMultipartUpload,
    RestoreObject,
    DeleteObject,
    DeleteObjects,
    AbortMultipartUpload,
}

impl ActionKind {
    /// Action name sent to the metering service
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PutObject => "putObject",
            ActionKind::CopyObject => "copyObject",
            ActionKind::UploadPart => "uploadPart",
            ActionKind::UploadPartCopy => "uploadPartCopy",
            ActionKind::CompleteMultipartUpload => "completeMultipartUpload",
            ActionKind::RestoreObject => "objectRestore",
            ActionKind::DeleteObject => "deleteObject",
            ActionKind::DeleteObjects => "deleteObjects",
            ActionKind::AbortMultipartUpload => "abortMultipartUpload",
        }
    }

    /// Operations that can only release space
    pub fn removes_data(&self) -> bool {
        matches!(
            self,
            ActionKind::DeleteObject | ActionKind::DeleteObjects | ActionKind::AbortMultipartUpload
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag carried by the write that completes an already admitted restore.
///
/// Its bytes were reserved when the restore was requested, so the write
/// skips admission entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreMarker(());

impl RestoreMarker {
    pub fn internal() -> Self {
        RestoreMarker(())
    }
}

/// Why an evaluation ended the way it did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionReason {
    /// Quota enforcement switched off
    QuotaDisabled,
    /// Bucket has no quota
    Unlimited,
    /// Internal restore-completion write
    RestoreBypass,
    /// Usage could not be determined
    MeteringUnavailable(String),
    /// Zero or negative delta
    DataRemoval,
    WithinQuota,
    QuotaExceeded,
}

/// Result of one evaluation
#[derive(Debug)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub bucket: String,
    pub delta_bytes: i64,
    pub quota_bytes: Option<u64>,
    /// `confirmed + pending + delta`, when usage was known
    pub projected_bytes: Option<i64>,
    reservation: Option<Reservation>,
}

impl AdmissionDecision {
    fn admitted(bucket: &BucketId, delta_bytes: i64, reason: DecisionReason) -> Self {
        AdmissionDecision {
            allowed: true,
            reason,
            bucket: bucket.name().to_string(),
            delta_bytes,
            quota_bytes: None,
            projected_bytes: None,
            reservation: None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reservation.is_some()
    }

    /// Turn the decision into an [`Admission`], or the error a denial maps to
    pub fn into_admission(self) -> QuotaResult<Admission> {
        if self.allowed {
            return Ok(Admission {
                bucket: self.bucket,
                delta_bytes: self.delta_bytes,
                reason: self.reason,
                reservation: self.reservation,
            });
        }
        match self.reason {
            DecisionReason::MeteringUnavailable(msg) => Err(QuotaError::MeteringUnavailable(msg)),
            _ => Err(QuotaError::QuotaExceeded {
                bucket: self.bucket,
                quota: self.quota_bytes.unwrap_or(0),
                projected: self.projected_bytes.unwrap_or(self.delta_bytes),
            }),
        }
    }
}

/// Ledger entry owned by an admitted operation; rolled back if dropped unresolved
struct Reservation {
    ledger: Arc<dyn InflightLedger>,
    handle: EntryHandle,
    resolved: bool,
}

impl Reservation {
    fn commit(mut self) {
        self.resolved = true;
        if let Err(e) = self.ledger.commit(&self.handle) {
            warn!(error = %e, "Commit failed");
        }
    }

    fn rollback(mut self) {
        self.resolved = true;
        if let Err(e) = self.ledger.rollback(&self.handle) {
            warn!(error = %e, "Rollback failed");
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("handle", &self.handle)
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        warn!(
            bucket = self.handle.bucket(),
            id = self.handle.id(),
            "Admission dropped without commit, rolling back"
        );
        if let Err(e) = self.ledger.rollback(&self.handle) {
            warn!(error = %e, "Rollback failed");
        }
    }
}

/// An admitted operation awaiting its outcome
///
/// Call [`Admission::commit`] once the write has succeeded and
/// [`Admission::rollback`] when it failed. Dropping it unresolved rolls back.
#[derive(Debug)]
pub struct Admission {
    bucket: String,
    delta_bytes: i64,
    reason: DecisionReason,
    reservation: Option<Reservation>,
}

impl Admission {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn delta_bytes(&self) -> i64 {
        self.delta_bytes
    }

    pub fn reason(&self) -> &DecisionReason {
        &self.reason
    }

    pub fn handle(&self) -> Option<&EntryHandle> {
        self.reservation.as_ref().map(|r| &r.handle)
    }

    pub fn commit(mut self) {
        if let Some(reservation) = self.reservation.take() {
            reservation.commit();
        }
    }

    /// Best effort; a failing rollback is logged and never surfaces
    pub fn rollback(mut self) {
        if let Some(reservation) = self.reservation.take() {
            reservation.rollback();
        }
    }
}

/// The quota gate
pub struct AdmissionEvaluator {
    store: Arc<dyn QuotaConfigStore>,
    metering: Arc<dyn UsageMetering>,
    ledger: Arc<dyn InflightLedger>,
    enabled: bool,
    failure_mode: FailureMode,
    health_check: bool,
    health_timeout: Duration,
    request_timeout: Duration,
    operation_timeout: Duration,
    metrics: Option<Arc<QuotaMetrics>>,
}

impl AdmissionEvaluator {
    pub fn new(
        store: Arc<dyn QuotaConfigStore>,
        metering: Arc<dyn UsageMetering>,
        ledger: Arc<dyn InflightLedger>,
        settings: &QuotaSettings,
    ) -> Self {
        AdmissionEvaluator {
            store,
            metering,
            ledger,
            enabled: settings.enabled,
            failure_mode: settings.failure_mode,
            health_check: settings.metering.health_check,
            health_timeout: settings.metering.health_timeout(),
            request_timeout: settings.metering.request_timeout(),
            operation_timeout: settings.operation_timeout(),
            metrics: None,
        }
    }

    /// Record evaluation durations and metering outages in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn InflightLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn QuotaConfigStore> {
        &self.store
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Decide whether `delta_bytes` may be added to `bucket`.
    ///
    /// Only quota store failures are returned as errors; a denial is a
    /// decision with `allowed == false`.
    pub async fn evaluate(
        &self,
        bucket: &BucketId,
        delta_bytes: i64,
        action: ActionKind,
        marker: Option<RestoreMarker>,
    ) -> QuotaResult<AdmissionDecision> {
        let started = Instant::now();
        let decision = self.decide(bucket, delta_bytes, action, marker).await;

        if let Some(metrics) = &self.metrics {
            let code = match &decision {
                Ok(d) => match d.reason {
                    DecisionReason::QuotaDisabled | DecisionReason::Unlimited => None,
                    DecisionReason::QuotaExceeded => Some(429),
                    DecisionReason::MeteringUnavailable(_) if !d.allowed => Some(503),
                    _ => Some(200),
                },
                Err(_) => Some(500),
            };
            if let Some(code) = code {
                metrics.observe_evaluation(action, code, started.elapsed());
            }
        }
        decision
    }

    async fn decide(
        &self,
        bucket: &BucketId,
        delta_bytes: i64,
        action: ActionKind,
        marker: Option<RestoreMarker>,
    ) -> QuotaResult<AdmissionDecision> {
        if !self.enabled {
            return Ok(AdmissionDecision::admitted(
                bucket,
                delta_bytes,
                DecisionReason::QuotaDisabled,
            ));
        }

        let Some(config) = self.store.get_quota(bucket.name())? else {
            return Ok(AdmissionDecision::admitted(
                bucket,
                delta_bytes,
                DecisionReason::Unlimited,
            ));
        };
        let quota_bytes = config.quota_bytes;

        if marker.is_some() {
            debug!(bucket = %bucket, delta_bytes, "Restore completion bypasses quota");
            let mut decision =
                AdmissionDecision::admitted(bucket, delta_bytes, DecisionReason::RestoreBypass);
            decision.quota_bytes = Some(quota_bytes);
            return Ok(decision);
        }

        let confirmed = match self.confirmed_usage(bucket, action, delta_bytes).await {
            Ok(confirmed) => confirmed,
            Err(reason) => return Ok(self.unavailable(bucket, delta_bytes, action, quota_bytes, reason)),
        };

        let quota = i64::try_from(quota_bytes).unwrap_or(i64::MAX);

        if delta_bytes <= 0 {
            let pending = self.ledger.pending_total(bucket.name());
            let mut decision =
                AdmissionDecision::admitted(bucket, delta_bytes, DecisionReason::DataRemoval);
            decision.quota_bytes = Some(quota_bytes);
            decision.projected_bytes = Some(confirmed + pending + delta_bytes);
            if delta_bytes != 0 {
                decision.reservation = Some(self.reservation(
                    self.ledger.reserve(bucket.name(), delta_bytes),
                ));
            }
            return Ok(decision);
        }

        let headroom = quota.saturating_sub(confirmed);
        match self.ledger.reserve_within(bucket.name(), delta_bytes, headroom) {
            Ok(handle) => {
                let pending = self.ledger.pending_total(bucket.name());
                debug!(
                    bucket = %bucket,
                    action = %action,
                    delta_bytes,
                    confirmed,
                    quota = quota_bytes,
                    "Admitted"
                );
                let mut decision =
                    AdmissionDecision::admitted(bucket, delta_bytes, DecisionReason::WithinQuota);
                decision.quota_bytes = Some(quota_bytes);
                decision.projected_bytes = Some(confirmed.saturating_add(pending));
                decision.reservation = Some(self.reservation(handle));
                Ok(decision)
            }
            Err(overdraft) => {
                let projected = confirmed
                    .saturating_add(overdraft.pending_total)
                    .saturating_add(delta_bytes);
                debug!(
                    bucket = %bucket,
                    action = %action,
                    delta_bytes,
                    confirmed,
                    pending = overdraft.pending_total,
                    projected,
                    quota = quota_bytes,
                    "Denied: quota exceeded"
                );
                Ok(AdmissionDecision {
                    allowed: false,
                    reason: DecisionReason::QuotaExceeded,
                    bucket: bucket.name().to_string(),
                    delta_bytes,
                    quota_bytes: Some(quota_bytes),
                    projected_bytes: Some(projected),
                    reservation: None,
                })
            }
        }
    }

    /// Evaluate and convert a denial into an error
    pub async fn admit(
        &self,
        bucket: &BucketId,
        delta_bytes: i64,
        action: ActionKind,
        marker: Option<RestoreMarker>,
    ) -> QuotaResult<Admission> {
        self.evaluate(bucket, delta_bytes, action, marker)
            .await?
            .into_admission()
    }

    /// Gate `op`, then commit on success or roll back on failure or timeout
    pub async fn run<T, E, F, Fut>(
        &self,
        bucket: &BucketId,
        delta_bytes: i64,
        action: ActionKind,
        marker: Option<RestoreMarker>,
        op: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<QuotaError>,
    {
        let admission = self.admit(bucket, delta_bytes, action, marker).await?;

        match tokio::time::timeout(self.operation_timeout, op()).await {
            Ok(Ok(value)) => {
                admission.commit();
                Ok(value)
            }
            Ok(Err(e)) => {
                admission.rollback();
                Err(e)
            }
            Err(_) => {
                warn!(
                    bucket = %bucket,
                    action = %action,
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "Admitted operation timed out, rolling back"
                );
                admission.rollback();
                Err(QuotaError::OperationTimedOut(format!("{} on {}", action, bucket)).into())
            }
        }
    }

    fn reservation(&self, handle: EntryHandle) -> Reservation {
        Reservation {
            ledger: Arc::clone(&self.ledger),
            handle,
            resolved: false,
        }
    }

    async fn confirmed_usage(
        &self,
        bucket: &BucketId,
        action: ActionKind,
        delta_bytes: i64,
    ) -> Result<i64, String> {
        if self.health_check {
            match tokio::time::timeout(self.health_timeout, self.metering.health_check()).await {
                Ok(Health::Healthy) => {}
                Ok(Health::Unhealthy) => return Err("metering service is unhealthy".to_string()),
                Err(_) => return Err("metering health check timed out".to_string()),
            }
        }

        match tokio::time::timeout(
            self.request_timeout,
            self.metering.fetch_usage(bucket, action, delta_bytes),
        )
        .await
        {
            Ok(Ok(snapshot)) => Ok(snapshot.confirmed_bytes),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("usage request timed out".to_string()),
        }
    }

    fn unavailable(
        &self,
        bucket: &BucketId,
        delta_bytes: i64,
        action: ActionKind,
        quota_bytes: u64,
        reason: String,
    ) -> AdmissionDecision {
        let allowed = match self.failure_mode {
            FailureMode::Open => true,
            FailureMode::Closed => delta_bytes <= 0 || action.removes_data(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.metrics_unavailable(if allowed { REASON_FAIL_OPEN } else { REASON_FAIL_CLOSED });
        }
        if allowed {
            warn!(
                bucket = %bucket,
                action = %action,
                delta_bytes,
                reason = %reason,
                "Metering unavailable, admitting without quota check"
            );
        } else {
            warn!(
                bucket = %bucket,
                action = %action,
                delta_bytes,
                reason = %reason,
                "Metering unavailable, denying"
            );
        }
        AdmissionDecision {
            allowed,
            reason: DecisionReason::MeteringUnavailable(reason),
            bucket: bucket.name().to_string(),
            delta_bytes,
            quota_bytes: Some(quota_bytes),
            projected_bytes: None,
            reservation: None,
        }
    }
}
