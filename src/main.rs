//! SDS Dock
//!
//! Loads the dock config, sets up every configured backend, and serves the
//! dispatch envelope over HTTP until interrupted.

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sds_dock::{init_registry, ApiServer, ApiServerConfig, Dock, DockConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// SDS Dock - one lifecycle API over heterogeneous storage backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Dock config file
    #[arg(long, env = "DOCK_CONFIG", default_value = "/etc/opensds/dock.yaml")]
    config: PathBuf,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting SDS Dock");
    info!("  Version: {}", sds_dock::VERSION);
    info!("  Config: {}", args.config.display());
    info!("  REST API: {}", args.api_addr);

    let config = DockConfig::load(&args.config)
        .with_context(|| format!("loading dock config {}", args.config.display()))?;

    let registry = Arc::new(init_registry());
    let dock = Dock::new(config, registry).context("creating dock")?;
    let _startup = dock.start();

    let shutdown = CancellationToken::new();

    // Start metrics server
    let metrics_registry = dock.metrics_registry().clone();
    let metrics_addr = args.metrics_addr;
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_registry, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args.api_addr,
        ..Default::default()
    };
    let api_server = Arc::new(ApiServer::new(api_config, dock.clone()));

    let server = api_server.clone();
    let api_handle = tokio::spawn(async move { server.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("Interrupt received, shutting down");

    shutdown.cancel();
    api_server.shutdown();
    match api_handle.await {
        Ok(Err(e)) => error!("API server error: {}", e),
        Err(e) => error!("API server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    dock.shutdown().await;
    info!("Dock shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
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
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("axum=info".parse()?);

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
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    registry: Registry,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                                error!("Failed to encode metrics: {}", e);
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            } else {
                                if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                *response.body_mut() = Body::from(buffer);
                            }
                        }
                        _ => {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            *response.body_mut() = Body::from("not found");
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .context("binding metrics server")?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("serving metrics")?;

    Ok(())
}
