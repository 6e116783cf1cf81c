//! Storage Backend Operator
//!
//! Reconciles StorageCluster and StorageNode custom resources against an
//! external provisioning service and runs the per-node storage daemon.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_backend_operator::backend::{BackendConfig, BackendFactory};
use storage_backend_operator::operator::{self, OperatorMetrics, OperatorState};
use storage_backend_operator::{Error, Result, StorageCluster, StorageNode};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Backend Operator - provisioning-service reconciliation for
/// declarative storage clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Storage backend to run (glusterfs)
    #[arg(long, env = "STORAGE_BACKEND", default_value = "glusterfs")]
    backend: String,

    /// Default image for the per-node storage daemon
    #[arg(long, env = "DAEMON_IMAGE")]
    daemon_image: Option<String>,

    /// Provisioning-service name, used for endpoint resolution and bootstrap
    #[arg(long, env = "PROVISIONER_SERVICE", default_value = "heketi")]
    provisioner_service: String,

    /// Provisioning-service port
    #[arg(long, env = "PROVISIONER_PORT", default_value = "8080")]
    provisioner_port: u16,

    /// Provisioning-service container image
    #[arg(long, env = "PROVISIONER_IMAGE", default_value = "heketi/heketi:latest")]
    provisioner_image: String,

    /// Seconds to wait for the provisioning daemon to become ready
    #[arg(long, env = "PROVISIONER_TIMEOUT", default_value = "300")]
    provisioner_timeout_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    export_crds: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.export_crds {
        return export_crds();
    }

    init_logging(&args);

    info!(
        "Starting {} v{}",
        storage_backend_operator::NAME,
        storage_backend_operator::VERSION
    );
    info!("  Backend: {}", args.backend);
    info!(
        "  Provisioning service: {}:{}",
        args.provisioner_service, args.provisioner_port
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::Kube)?;

    let mut config = BackendConfig::default();
    if let Some(image) = &args.daemon_image {
        config.glusterfs.default_image = image.clone();
    }
    config.glusterfs.endpoint.service = args.provisioner_service.clone();
    config.glusterfs.endpoint.port = args.provisioner_port;
    config.glusterfs.bootstrap.name = args.provisioner_service.clone();
    config.glusterfs.bootstrap.port = args.provisioner_port;
    config.glusterfs.bootstrap.image = args.provisioner_image.clone();
    config.glusterfs.bootstrap.timeout = Duration::from_secs(args.provisioner_timeout_secs);

    let backend = BackendFactory::create(&args.backend, client.clone(), config)?;
    let metrics = OperatorMetrics::new(prometheus::default_registry())?;

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let state = Arc::new(OperatorState {
        client,
        backend,
        metrics,
    });
    operator::run(state).await?;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// CRD Export
// =============================================================================

fn export_crds() -> Result<()> {
    use kube::CustomResourceExt;

    let cluster_crd = serde_yaml::to_string(&StorageCluster::crd())
        .map_err(|e| Error::Internal(format!("CRD serialization failed: {}", e)))?;
    let node_crd = serde_yaml::to_string(&StorageNode::crd())
        .map_err(|e| Error::Internal(format!("CRD serialization failed: {}", e)))?;

    println!("{}---\n{}", cluster_crd, node_crd);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
