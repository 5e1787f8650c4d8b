//! Quota Gate S3 Server
//!
//! S3-compatible HTTP server with per-bucket quota admission

use quota_gate::quota::monitoring::serve_metrics;
use quota_gate::quota::{
    AdmissionEvaluator, HttpMeteringClient, InflightLedger, LocalLedger, QuotaMetrics,
    ReconciliationTimer,
};
use quota_gate::{BucketCatalog, GatewayBackend, QuotaRoute, QuotaSettings};

use anyhow::{bail, Context};
use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

// s3s imports
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use s3s::service::S3ServiceBuilder;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "quota-gate-server")]
#[command(about = "S3-compatible HTTP server with bucket quota admission")]
struct Args {
    /// Bind address
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port number
    #[arg(short = 'P', long, default_value = "9000")]
    port: u16,

    /// AWS Access Key ID (enables authentication)
    #[arg(long)]
    access_key: Option<String>,

    /// AWS Secret Access Key (required if access_key is set)
    #[arg(long)]
    secret_key: Option<String>,

    /// Quota settings file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Metering service URL, overrides the config file
    #[arg(long)]
    metering_endpoint: Option<String>,

    /// Disable quota enforcement
    #[arg(long)]
    no_quota: bool,

    /// Access key of the restore service, overrides the config file
    #[arg(long)]
    restore_access_key: Option<String>,

    /// Secret key of the restore service (required with authentication)
    #[arg(long)]
    restore_secret_key: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn load_settings(args: &Args) -> anyhow::Result<QuotaSettings> {
    let mut settings = match &args.config {
        Some(path) => {
            info!("Loading quota settings from {:?}", path);
            QuotaSettings::load(path)
                .with_context(|| format!("Failed to load settings from {:?}", path))?
        }
        None => QuotaSettings::default(),
    };

    if let Some(endpoint) = &args.metering_endpoint {
        settings.metering.endpoint = endpoint.clone();
    }
    if args.no_quota {
        settings.enabled = false;
    }
    if let Some(access_key) = &args.restore_access_key {
        settings.restore_access_key = Some(access_key.clone());
    }
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!("Starting Quota Gate S3 Server");

    let settings = load_settings(&args)?;
    info!(
        "Quota settings: enabled={}, failure_mode={:?}, window={}ms, metering={}",
        settings.enabled,
        settings.failure_mode,
        settings.reconciliation_window_ms,
        settings.metering.endpoint
    );

    let registry = Registry::new();
    let metrics = Arc::new(QuotaMetrics::new()?);
    metrics.register(&registry)?;

    let metering = Arc::new(HttpMeteringClient::new(&settings.metering)?.with_metrics(metrics.clone()));
    let ledger: Arc<dyn InflightLedger> = Arc::new(
        LocalLedger::new(settings.reconciliation_window())
            .with_max_pending_age(settings.max_pending_age()),
    );
    let timer = ReconciliationTimer::start(ledger.clone(), settings.flush_interval());

    let catalog = Arc::new(BucketCatalog::new());
    let evaluator = AdmissionEvaluator::new(catalog.clone(), metering, ledger, &settings)
        .with_metrics(metrics);
    let mut backend = GatewayBackend::new(catalog, Arc::new(evaluator));
    if let Some(access_key) = &settings.restore_access_key {
        backend = backend.with_restore_principal(access_key.clone());
        info!("Restore completions accepted from access key: {}", access_key);
    }
    let admin = backend.quota_admin();

    info!("S3 backend initialized");

    // Validate authentication args
    if args.access_key.is_some() != args.secret_key.is_some() {
        bail!("Both --access-key and --secret-key must be provided together");
    }
    let require_auth = args.access_key.is_some();
    if require_auth && settings.restore_access_key.is_some() && args.restore_secret_key.is_none() {
        bail!("--restore-secret-key is required when authentication is enabled");
    }

    let metrics_server = match args.metrics_port {
        Some(port) => {
            let addr: SocketAddr = format!("{}:{}", args.host, port).parse()?;
            let listener = TcpListener::bind(addr)
                .await
                .context("Failed to bind metrics endpoint")?;
            Some(tokio::spawn(serve_metrics(listener, registry)))
        }
        None => None,
    };

    // Create S3 service using s3s
    let service = {
        let mut builder = S3ServiceBuilder::new(backend);

        // Set up authentication if credentials provided
        if let (Some(access_key), Some(secret_key)) = (&args.access_key, &args.secret_key) {
            use s3s::auth::SimpleAuth;
            let mut auth = SimpleAuth::from_single(access_key.clone(), secret_key.clone());
            if let (Some(restore_key), Some(restore_secret)) =
                (&settings.restore_access_key, &args.restore_secret_key)
            {
                auth.register(restore_key.clone(), restore_secret.clone().into());
            }
            builder.set_auth(auth);
            info!("Authentication enabled for access key: {}", access_key);
        } else {
            info!("Running without authentication (open access)");
        }

        builder.set_route(QuotaRoute::new(admin, require_auth));
        builder.build()
    };

    // Parse bind address
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let http_server = ConnBuilder::new(TokioExecutor::new());

    info!("HTTP server running at http://{}", local_addr);
    info!("Use with: aws --endpoint-url=http://{} s3 ...", local_addr);

    loop {
        // Accept connection or wait for Ctrl+C
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, _)) => {
                        let service_clone = service.clone();
                        let http_server_clone = http_server.clone();
                        tokio::spawn(async move {
                            let conn = http_server_clone.serve_connection(TokioIo::new(socket), service_clone);
                            if let Err(e) = conn.await {
                                error!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    if let Some(handle) = metrics_server {
        handle.abort();
    }
    timer.stop().await;
    info!("Server stopped");

    Ok(())
}
