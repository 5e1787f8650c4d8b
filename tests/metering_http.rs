//! HTTP metering client against a stub metering service

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use quota_gate::quota::{
    ActionKind, BucketId, Health, HttpMeteringClient, InflightLedger, LocalLedger,
    QuotaConfigStore, QuotaMetrics, UsageMetering,
};
use quota_gate::quota::monitoring::REASON_STALE;
use quota_gate::{GatewayBackend, MeteringSettings, QuotaError, QuotaSettings};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Scriptable metering service
struct Stub {
    health_status: AtomicU16,
    metrics_status: AtomicU16,
    bytes_total: AtomicI64,
    date: Mutex<Option<DateTime<Utc>>>,
    requests: Mutex<Vec<(String, serde_json::Value)>>,
}

impl Stub {
    fn new() -> Arc<Self> {
        Arc::new(Stub {
            health_status: AtomicU16::new(200),
            metrics_status: AtomicU16::new(200),
            bytes_total: AtomicI64::new(0),
            date: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn metrics_requests(&self) -> Vec<(String, serde_json::Value)> {
        self.requests
            .lock()
            .iter()
            .filter(|(path, _)| path.starts_with("/metrics/"))
            .cloned()
            .collect()
    }
}

fn reply(status: u16, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp
}

async fn handle(stub: Arc<Stub>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    stub.requests.lock().push((path.clone(), json));

    let resp = if path == "/health/deep" {
        reply(stub.health_status.load(Ordering::SeqCst), String::new())
    } else if path.starts_with("/metrics/bucket/") && path.ends_with("/latest") {
        let mut payload = serde_json::json!({
            "bytesTotal": stub.bytes_total.load(Ordering::SeqCst),
        });
        if let Some(date) = *stub.date.lock() {
            payload["date"] = serde_json::Value::String(date.to_rfc3339());
        }
        reply(stub.metrics_status.load(Ordering::SeqCst), payload.to_string())
    } else {
        reply(404, String::new())
    };
    Ok(resp)
}

async fn spawn_stub(stub: Arc<Stub>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let stub = stub.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(stub.clone(), req));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(socket), service)
                    .await;
            });
        }
    });
    addr
}

fn settings(addr: SocketAddr) -> MeteringSettings {
    MeteringSettings {
        endpoint: format!("http://{}", addr),
        request_timeout_ms: 2000,
        health_timeout_ms: 2000,
        health_ttl_ms: 0,
        ..MeteringSettings::default()
    }
}

fn bucket() -> BucketId {
    BucketId::new("photos", Utc::now())
}

#[tokio::test]
async fn test_fetch_usage_contract() {
    let stub = Stub::new();
    stub.bytes_total.store(4096, Ordering::SeqCst);
    let addr = spawn_stub(stub.clone()).await;
    let client = HttpMeteringClient::new(&settings(addr)).unwrap();

    let id = bucket();
    let snapshot = client
        .fetch_usage(&id, ActionKind::PutObject, 42)
        .await
        .unwrap();
    assert_eq!(snapshot.confirmed_bytes, 4096);
    assert_eq!(snapshot.bucket_name, "photos");
    assert_eq!(snapshot.reported_at, None);

    let requests = stub.metrics_requests();
    assert_eq!(requests.len(), 1);
    let (path, body) = &requests[0];
    assert_eq!(path, &format!("/metrics/bucket/{}/latest", id.metering_key()));
    assert_eq!(body["action"], "putObject");
    assert_eq!(body["inflight"], 42);
}

#[tokio::test]
async fn test_restore_action_name() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let client = HttpMeteringClient::new(&settings(addr)).unwrap();

    client
        .fetch_usage(&bucket(), ActionKind::RestoreObject, 10)
        .await
        .unwrap();
    assert_eq!(stub.metrics_requests()[0].1["action"], "objectRestore");
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let stub = Stub::new();
    stub.metrics_status.store(503, Ordering::SeqCst);
    let addr = spawn_stub(stub.clone()).await;
    let client = HttpMeteringClient::new(&settings(addr)).unwrap();

    let err = client
        .fetch_usage(&bucket(), ActionKind::PutObject, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::MeteringUnavailable(_)));
}

#[tokio::test]
async fn test_stale_metrics_are_unavailable() {
    let stub = Stub::new();
    stub.bytes_total.store(10, Ordering::SeqCst);
    *stub.date.lock() = Some(Utc::now() - chrono::Duration::days(2));
    let addr = spawn_stub(stub.clone()).await;
    let metrics = Arc::new(QuotaMetrics::new().unwrap());
    let client = HttpMeteringClient::new(&settings(addr))
        .unwrap()
        .with_metrics(metrics.clone());

    let err = client
        .fetch_usage(&bucket(), ActionKind::PutObject, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::MeteringUnavailable(_)));
    assert_eq!(metrics.unavailable_count(REASON_STALE), 1);

    let fresh = Utc::now() - chrono::Duration::minutes(5);
    *stub.date.lock() = Some(fresh);
    let snapshot = client
        .fetch_usage(&bucket(), ActionKind::PutObject, 1)
        .await
        .unwrap();
    assert_eq!(snapshot.confirmed_bytes, 10);
    assert!(snapshot.reported_at.is_some());
    assert_eq!(metrics.unavailable_count(REASON_STALE), 1);
}

#[tokio::test]
async fn test_health_check() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let client = HttpMeteringClient::new(&settings(addr)).unwrap();

    assert_eq!(client.health_check().await, Health::Healthy);
    stub.health_status.store(500, Ordering::SeqCst);
    assert_eq!(client.health_check().await, Health::Unhealthy);
}

#[tokio::test]
async fn test_health_result_is_reused() {
    let stub = Stub::new();
    let addr = spawn_stub(stub.clone()).await;
    let client = HttpMeteringClient::new(&MeteringSettings {
        health_ttl_ms: 60_000,
        ..settings(addr)
    })
    .unwrap();

    assert_eq!(client.health_check().await, Health::Healthy);
    stub.health_status.store(500, Ordering::SeqCst);
    assert_eq!(client.health_check().await, Health::Healthy);

    let checks = stub
        .requests
        .lock()
        .iter()
        .filter(|(path, _)| path == "/health/deep")
        .count();
    assert_eq!(checks, 1);
}

#[tokio::test]
async fn test_unreachable_service() {
    // Bind and drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = HttpMeteringClient::new(&settings(addr)).unwrap();

    assert_eq!(client.health_check().await, Health::Unhealthy);
    assert!(matches!(
        client.fetch_usage(&bucket(), ActionKind::PutObject, 1).await,
        Err(QuotaError::MeteringUnavailable(_))
    ));
}

#[tokio::test]
async fn test_snapshot_cache() {
    let stub = Stub::new();
    stub.bytes_total.store(100, Ordering::SeqCst);
    let addr = spawn_stub(stub.clone()).await;
    let client = HttpMeteringClient::new(&MeteringSettings {
        snapshot_ttl_ms: 60_000,
        ..settings(addr)
    })
    .unwrap();

    let id = bucket();
    client.fetch_usage(&id, ActionKind::PutObject, 1).await.unwrap();
    stub.bytes_total.store(200, Ordering::SeqCst);
    let cached = client.fetch_usage(&id, ActionKind::PutObject, 1).await.unwrap();
    assert_eq!(cached.confirmed_bytes, 100);
    assert_eq!(stub.metrics_requests().len(), 1);

    client.invalidate(&id);
    let fresh = client.fetch_usage(&id, ActionKind::PutObject, 1).await.unwrap();
    assert_eq!(fresh.confirmed_bytes, 200);
    assert_eq!(stub.metrics_requests().len(), 2);
}

#[tokio::test]
async fn test_gateway_against_metering_service() {
    let stub = Stub::new();
    stub.bytes_total.store(900, Ordering::SeqCst);
    let addr = spawn_stub(stub.clone()).await;

    let settings = QuotaSettings {
        metering: settings(addr),
        ..QuotaSettings::default()
    };
    let metering = Arc::new(HttpMeteringClient::new(&settings.metering).unwrap());
    let ledger = Arc::new(LocalLedger::new(settings.reconciliation_window()));
    let backend = GatewayBackend::with_quota(metering, ledger.clone(), &settings);

    backend.create_bucket("photos").unwrap();
    backend.catalog().set_quota("photos", 1000).unwrap();

    let err = backend
        .put_object("photos", "k", Bytes::from(vec![0u8; 200]))
        .await
        .unwrap_err();
    assert!(err.is_quota_exceeded());

    backend
        .put_object("photos", "k", Bytes::from(vec![0u8; 100]))
        .await
        .unwrap();
    assert_eq!(ledger.pending_total("photos"), 100);

    // Unhealthy service: admitted without a reservation
    stub.health_status.store(503, Ordering::SeqCst);
    backend
        .put_object("photos", "other", Bytes::from(vec![0u8; 5000]))
        .await
        .unwrap();
    assert_eq!(ledger.pending_total("photos"), 100);
}
