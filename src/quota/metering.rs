//! Client side of the usage metering service
//!
//! The metering service is the source of truth for a bucket's stored bytes.
//! It is consulted on every gated operation, so every call carries its own
//! timeout and any failure is reported as
//! [`QuotaError::MeteringUnavailable`] for the evaluator's fail-open policy.
//!
//! Wire contract:
//!
//! - `GET /health/deep`: 2xx healthy, anything else unhealthy
//! - `POST /metrics/bucket/{bucketKey}/latest` with `{"action", "inflight"}`,
//!   answered by `{"bytesTotal", "date"?}`

use crate::config::MeteringSettings;
use crate::error::{QuotaError, QuotaResult};
use crate::quota::evaluator::ActionKind;
use crate::quota::monitoring::{QuotaMetrics, REASON_STALE};
use crate::quota::BucketId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Confirmed usage for one bucket
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSnapshot {
    pub bucket_name: String,
    /// Current plus noncurrent bytes already aggregated by the service
    pub confirmed_bytes: i64,
    /// When this process received the figure
    pub fetched_at: Instant,
    /// When the service computed the figure, if it says so
    pub reported_at: Option<DateTime<Utc>>,
}

/// Result of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// Source of confirmed bucket usage
#[async_trait]
pub trait UsageMetering: Send + Sync {
    /// Fetch the bucket's confirmed usage.
    ///
    /// `inflight` is the delta of the operation being evaluated. It is a
    /// hint the service may use to pre-aggregate; it does not change the
    /// returned figure's meaning.
    async fn fetch_usage(
        &self,
        bucket: &BucketId,
        action: ActionKind,
        inflight: i64,
    ) -> QuotaResult<UsageSnapshot>;

    /// Cheap liveness check, independent of `fetch_usage`
    async fn health_check(&self) -> Health;
}

#[derive(Debug, Serialize)]
struct LatestMetricsRequest {
    action: &'static str,
    inflight: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestMetricsResponse {
    bytes_total: i64,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

/// True when a figure reported at `reported_at` is older than `max_staleness`
pub fn is_stale(reported_at: DateTime<Utc>, now: DateTime<Utc>, max_staleness: Duration) -> bool {
    chrono::Duration::from_std(max_staleness)
        .map(|limit| now.signed_duration_since(reported_at) > limit)
        .unwrap_or(false)
}

/// HTTP client for the metering service
pub struct HttpMeteringClient {
    client: reqwest::Client,
    endpoint: String,
    settings: MeteringSettings,
    snapshots: Mutex<LruCache<String, UsageSnapshot>>,
    last_health: Mutex<Option<(Instant, Health)>>,
    metrics: Option<Arc<QuotaMetrics>>,
}

impl HttpMeteringClient {
    pub fn new(settings: &MeteringSettings) -> QuotaResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| QuotaError::Config(format!("Failed to build metering client: {}", e)))?;

        let capacity = NonZeroUsize::new(settings.snapshot_cache_capacity).unwrap_or(NonZeroUsize::MIN);

        Ok(HttpMeteringClient {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            settings: settings.clone(),
            snapshots: Mutex::new(LruCache::new(capacity)),
            last_health: Mutex::new(None),
            metrics: None,
        })
    }

    /// Count stale responses in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn latest_url(&self, bucket_key: &str) -> String {
        format!("{}/metrics/bucket/{}/latest", self.endpoint, bucket_key)
    }

    fn health_url(&self) -> String {
        format!("{}/health/deep", self.endpoint)
    }

    fn cached_snapshot(&self, bucket_key: &str) -> Option<UsageSnapshot> {
        let ttl = self.settings.snapshot_ttl();
        if ttl.is_zero() {
            return None;
        }
        let mut snapshots = self.snapshots.lock();
        match snapshots.get(bucket_key) {
            Some(snapshot) if snapshot.fetched_at.elapsed() < ttl => Some(snapshot.clone()),
            Some(_) => {
                snapshots.pop(bucket_key);
                None
            }
            None => None,
        }
    }

    /// Drop any cached snapshot for the bucket
    pub fn invalidate(&self, bucket: &BucketId) {
        self.snapshots.lock().pop(&bucket.metering_key());
    }
}

#[async_trait]
impl UsageMetering for HttpMeteringClient {
    async fn fetch_usage(
        &self,
        bucket: &BucketId,
        action: ActionKind,
        inflight: i64,
    ) -> QuotaResult<UsageSnapshot> {
        let bucket_key = bucket.metering_key();
        if let Some(snapshot) = self.cached_snapshot(&bucket_key) {
            debug!(bucket = %bucket, bytes = snapshot.confirmed_bytes, "Serving cached usage snapshot");
            return Ok(snapshot);
        }

        let response = self
            .client
            .post(self.latest_url(&bucket_key))
            .timeout(self.settings.request_timeout())
            .json(&LatestMetricsRequest {
                action: action.as_str(),
                inflight,
            })
            .send()
            .await
            .map_err(|e| QuotaError::MeteringUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QuotaError::MeteringUnavailable(format!(
                "metrics request for {} returned {}",
                bucket_key, status
            )));
        }

        let body: LatestMetricsResponse = response
            .json()
            .await
            .map_err(|e| QuotaError::MeteringUnavailable(format!("invalid metrics body: {}", e)))?;

        if let Some(reported_at) = body.date {
            if is_stale(reported_at, Utc::now(), self.settings.max_staleness()) {
                warn!(
                    bucket = %bucket,
                    action = %action,
                    inflight,
                    reported_at = %reported_at,
                    "Stale metrics from the metering service"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.metrics_unavailable(REASON_STALE);
                }
                return Err(QuotaError::MeteringUnavailable(format!(
                    "metrics for {} are stale (reported at {})",
                    bucket_key, reported_at
                )));
            }
        }

        let snapshot = UsageSnapshot {
            bucket_name: bucket.name().to_string(),
            confirmed_bytes: body.bytes_total,
            fetched_at: Instant::now(),
            reported_at: body.date,
        };

        if !self.settings.snapshot_ttl().is_zero() {
            self.snapshots.lock().put(bucket_key, snapshot.clone());
        }

        Ok(snapshot)
    }

    async fn health_check(&self) -> Health {
        let last = *self.last_health.lock();
        if let Some((checked_at, health)) = last {
            if checked_at.elapsed() < self.settings.health_ttl() {
                return health;
            }
        }

        let health = match self
            .client
            .get(self.health_url())
            .timeout(self.settings.health_timeout())
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Health::Healthy,
            Ok(response) => {
                warn!(status = %response.status(), "Metering service reported unhealthy");
                Health::Unhealthy
            }
            Err(e) => {
                warn!(error = %e, "Metering health check failed");
                Health::Unhealthy
            }
        };

        *self.last_health.lock() = Some((Instant::now(), health));
        health
    }
}

/// Metering source driven by hand
///
/// Usage is set per bucket name. Useful for tests and for running the
/// gateway without a metering deployment.
#[derive(Debug)]
pub struct ManualMetering {
    usage: RwLock<HashMap<String, i64>>,
    healthy: AtomicBool,
    reachable: AtomicBool,
    fetches: AtomicUsize,
    last_request: Mutex<Option<(String, ActionKind, i64)>>,
}

impl Default for ManualMetering {
    fn default() -> Self {
        ManualMetering {
            usage: RwLock::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            fetches: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }
}

impl ManualMetering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the confirmed usage reported for a bucket
    pub fn set_usage(&self, bucket: &str, bytes: i64) {
        self.usage.write().insert(bucket.to_string(), bytes);
    }

    pub fn usage(&self, bucket: &str) -> i64 {
        self.usage.read().get(bucket).copied().unwrap_or(0)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// When unreachable, every fetch fails
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Bucket key, action and inflight hint of the last fetch
    pub fn last_request(&self) -> Option<(String, ActionKind, i64)> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl UsageMetering for ManualMetering {
    async fn fetch_usage(
        &self,
        bucket: &BucketId,
        action: ActionKind,
        inflight: i64,
    ) -> QuotaResult<UsageSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some((bucket.metering_key(), action, inflight));

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(QuotaError::MeteringUnavailable(
                "connection refused".to_string(),
            ));
        }

        Ok(UsageSnapshot {
            bucket_name: bucket.name().to_string(),
            confirmed_bytes: self.usage(bucket.name()),
            fetched_at: Instant::now(),
            reported_at: Some(Utc::now()),
        })
    }

    async fn health_check(&self) -> Health {
        if self.healthy.load(Ordering::SeqCst) {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }
}
