//! Kafka Edge Proxy CLI
//!
//! A transparent TCP proxy between Kafka clients and brokers: rewrites
//! advertised broker addresses and layers SASL/gateway authentication
//! without reconfiguring either side.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_edge_core::config::{LoggingConfig, ProxyConfig};
use kafka_edge_core::network::ProxyListeners;
use kafka_edge_core::{Collaborators, ConnSet, ConnectionHandler, ProxyMetrics, Supervisor};

/// Kafka edge proxy.
#[derive(Parser)]
#[command(name = "kafka-edge-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ProxyConfig::from_file(&args.config)?;
    init_logging(&config.logging, args.verbose);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listeners = config.listeners.len(),
        "starting kafka edge proxy"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_proxy(config))
}

/// Install the tracing subscriber. `-v` flags trump the configured level;
/// `RUST_LOG`, when set, trumps both.
fn init_logging(config: &LoggingConfig, verbosity: u8) {
    let level = match verbosity {
        0 => config.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run_proxy(config: ProxyConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(ProxyMetrics::new());
    let conns = Arc::new(ConnSet::new());

    // The plugin-backed collaborators (password verification, token
    // issuance/verification, address mapping) are wired in by the
    // deployment; the bare binary runs as a transparent proxy.
    let handler = Arc::new(ConnectionHandler::from_config(
        &config,
        Collaborators::default(),
        Arc::clone(&conns),
        Arc::clone(&metrics),
    )?);

    if config.metrics.enabled {
        let metrics = Arc::clone(&metrics);
        let address = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(&address, metrics).await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    let shutdown = CancellationToken::new();
    let listeners = ProxyListeners::new(config.listeners.clone(), shutdown.clone());

    let supervisor = Supervisor::new(handler, conns);
    let stop = supervisor.stop_handle();

    // Listeners feed the supervisor; dropping the sender on listener
    // shutdown closes the channel and drains the supervisor.
    let (conn_tx, conn_rx) = mpsc::channel(1024);
    let listener_task = tokio::spawn(listeners.run(conn_tx));

    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown signal received, stopping proxy");
        shutdown.cancel();
        stop.cancel();
    });

    supervisor.run(conn_rx).await?;
    listener_task.await??;

    info!("proxy shutdown complete");
    Ok(())
}

/// Resolves on SIGINT, and on SIGTERM where the platform has one.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Serve the Prometheus text endpoint: GET /metrics, 404 for anything
/// else.
async fn serve_metrics(address: &str, metrics: Arc<ProxyMetrics>) -> anyhow::Result<()> {
    let address: SocketAddr = address.parse()?;
    let listener = TcpListener::bind(address).await?;
    info!(address = %address, "metrics server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move { Ok::<_, hyper::Error>(metrics_response(&request, &metrics)) }
            });

            let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            if let Err(e) = connection.await {
                debug!(peer = %peer, error = %e, "metrics connection error");
            }
        });
    }
}

fn metrics_response(request: &Request<Incoming>, metrics: &ProxyMetrics) -> Response<Full<Bytes>> {
    if request.method() != Method::GET || request.uri().path() != "/metrics" {
        let mut not_found = Response::new(Full::new(Bytes::new()));
        *not_found.status_mut() = StatusCode::NOT_FOUND;
        return not_found;
    }

    let body = metrics.encode().unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
