//! Prometheus instrumentation of the quota gate
//!
//! - `quota_evaluation_duration_seconds{action,type,code}`: time spent
//!   evaluating admissions against a configured quota
//! - `quota_metrics_unavailable_total{reason}`: requests evaluated without
//!   usable metering figures (`stale`, `fail_open`, `fail_closed`)
//!
//! [`serve_metrics`] exposes a registry on `/metrics` for scraping.

use crate::error::{QuotaError, QuotaResult};
use crate::quota::evaluator::ActionKind;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Resource type label; quotas are bucket-scoped
const RESOURCE_BUCKET: &str = "bucket";

pub const REASON_STALE: &str = "stale";
pub const REASON_FAIL_OPEN: &str = "fail_open";
pub const REASON_FAIL_CLOSED: &str = "fail_closed";

/// Quota gate metrics, shared by the evaluator and the metering client
#[derive(Clone)]
pub struct QuotaMetrics {
    evaluation_duration: HistogramVec,
    metrics_unavailable: IntCounterVec,
}

impl QuotaMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let evaluation_duration = HistogramVec::new(
            HistogramOpts::new(
                "quota_evaluation_duration_seconds",
                "Duration of quota admission evaluations",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["action", "type", "code"],
        )?;
        let metrics_unavailable = IntCounterVec::new(
            Opts::new(
                "quota_metrics_unavailable_total",
                "Requests evaluated without usable metering figures",
            ),
            &["reason"],
        )?;
        Ok(QuotaMetrics {
            evaluation_duration,
            metrics_unavailable,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.evaluation_duration.clone()))?;
        registry.register(Box::new(self.metrics_unavailable.clone()))?;
        Ok(())
    }

    /// `code` is the HTTP status the decision maps to
    pub fn observe_evaluation(&self, action: ActionKind, code: u16, elapsed: Duration) {
        self.evaluation_duration
            .with_label_values(&[action.as_str(), RESOURCE_BUCKET, &code.to_string()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn evaluation_count(&self, action: ActionKind, code: u16) -> u64 {
        self.evaluation_duration
            .with_label_values(&[action.as_str(), RESOURCE_BUCKET, &code.to_string()])
            .get_sample_count()
    }

    pub fn metrics_unavailable(&self, reason: &str) {
        self.metrics_unavailable.with_label_values(&[reason]).inc();
    }

    pub fn unavailable_count(&self, reason: &str) -> u64 {
        self.metrics_unavailable.with_label_values(&[reason]).get()
    }
}

/// Encode every metric in `registry` in the Prometheus text format
pub fn gather(registry: &Registry) -> QuotaResult<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| QuotaError::Config(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| QuotaError::Config(format!("Invalid UTF-8 in metrics: {}", e)))
}

/// Serve `registry` on `/metrics` until the task is dropped
pub async fn serve_metrics(listener: TcpListener, registry: Registry) {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics endpoint at http://{}/metrics", addr);
    }
    loop {
        let socket = match listener.accept().await {
            Ok((socket, _)) => socket,
            Err(e) => {
                error!("Failed to accept metrics connection: {}", e);
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| scrape(registry.clone(), req));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(socket), service)
                .await
            {
                debug!("Metrics connection error: {}", e);
            }
        });
    }
}

async fn scrape(
    registry: Registry,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match req.uri().path() {
        "/metrics" => match gather(&registry) {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => {
                error!("Failed to gather metrics: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        "/health" => (StatusCode::OK, String::new()),
        _ => (StatusCode::NOT_FOUND, String::new()),
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_label() {
        let metrics = QuotaMetrics::new().unwrap();
        metrics.metrics_unavailable(REASON_STALE);
        metrics.metrics_unavailable(REASON_STALE);
        metrics.metrics_unavailable(REASON_FAIL_OPEN);
        assert_eq!(metrics.unavailable_count(REASON_STALE), 2);
        assert_eq!(metrics.unavailable_count(REASON_FAIL_CLOSED), 0);

        metrics.observe_evaluation(ActionKind::PutObject, 429, Duration::from_millis(3));
        assert_eq!(metrics.evaluation_count(ActionKind::PutObject, 429), 1);
        assert_eq!(metrics.evaluation_count(ActionKind::PutObject, 200), 0);
    }

    #[test]
    fn test_gather_text_format() {
        let registry = Registry::new();
        let metrics = QuotaMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        // Registering twice is refused
        assert!(metrics.register(&registry).is_err());

        metrics.observe_evaluation(ActionKind::DeleteObject, 200, Duration::from_millis(1));
        metrics.metrics_unavailable(REASON_FAIL_OPEN);

        let text = gather(&registry).unwrap();
        assert!(text.contains("quota_evaluation_duration_seconds_count"));
        assert!(text.contains("action=\"deleteObject\""));
        assert!(text.contains("quota_metrics_unavailable_total{reason=\"fail_open\"} 1"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let registry = Registry::new();
        let metrics = QuotaMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        metrics.metrics_unavailable(REASON_STALE);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_metrics(listener, registry));

        let reply = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
        assert_eq!(reply.status(), reqwest::StatusCode::OK);
        let text = reply.text().await.unwrap();
        assert!(text.contains("quota_metrics_unavailable_total{reason=\"stale\"} 1"));

        let missing = reqwest::get(format!("http://{}/other", addr)).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        server.abort();
    }
}
