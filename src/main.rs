//! Service entry point.
//!
//! Parses the CLI, initializes tracing, and runs the selected role until an
//! interrupt flips the shutdown signal. Startup talks to the backend with
//! retries; a backend that stays unreachable is an unrecoverable startup
//! failure and exits non-zero.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ndspipe::backend::BackendClient;
use ndspipe::cli::{Cli, Role};
use ndspipe::gateway::client::GatewayClient;
use ndspipe::gateway::{GatewayState, bootstrap_pools, router};
use ndspipe::pool::{PoolMap, run_sweeper};
use ndspipe::scanner::Scanner;
use ndspipe::signal;
use ndspipe::worker::decode::{AnalyticsSink, DiscardSink, HttpAnalyticsSink};
use ndspipe::worker::{Worker, default_capacity};

/// Attempts for startup calls against the backend.
const STARTUP_RETRIES: u32 = 3;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let backend = BackendClient::new(&cli.backend_url).context("backend client")?;

    let (shutdown_tx, shutdown_rx) = signal::shutdown_channel();
    tokio::spawn(signal::on_interrupt(shutdown_tx));

    match cli.role {
        Role::Gateway => run_gateway(&cli, backend, shutdown_rx).await,
        Role::Scanner => run_scanner(&cli, backend, shutdown_rx).await,
        Role::Worker => run_worker(&cli, backend, shutdown_rx).await,
    }
}

async fn run_gateway(
    cli: &Cli,
    backend: BackendClient,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let pools = Arc::new(PoolMap::new());
    let state = Arc::new(GatewayState { pools: Arc::clone(&pools), backend: backend.clone() });

    retry_startup("pool bootstrap", || bootstrap_pools(&state)).await?;
    register(cli, &backend).await?;

    let sweeper = tokio::spawn(run_sweeper(Arc::clone(&pools), shutdown.clone()));

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("bind {addr}"))?;
    info!(%addr, "gateway listening");

    let mut stop = shutdown.clone();
    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stop| *stop).await;
        })
        .await
        .context("gateway server")?;

    sweeper.await.ok();
    state.pools.shutdown().await;
    unregister(cli, &backend).await;
    info!("gateway stopped");
    Ok(())
}

async fn run_scanner(
    cli: &Cli,
    backend: BackendClient,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let gateway = gateway_client(cli)?;
    register(cli, &backend).await?;

    let scanner = Arc::new(Scanner::new(backend.clone(), gateway));
    Arc::clone(&scanner).run(shutdown).await;

    unregister(cli, &backend).await;
    Ok(())
}

async fn run_worker(
    cli: &Cli,
    backend: BackendClient,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let gateway = gateway_client(cli)?;
    register(cli, &backend).await?;

    let sink: Arc<dyn AnalyticsSink> = match &cli.analytics_url {
        Some(url) => Arc::new(HttpAnalyticsSink::new(url).context("analytics sink")?),
        None => {
            warn!("no analytics url configured, decoded rows will be discarded");
            Arc::new(DiscardSink::default())
        }
    };

    let capacity = cli.capacity.unwrap_or_else(default_capacity);
    let worker = Arc::new(Worker::new(backend.clone(), gateway, sink, capacity));
    Arc::clone(&worker).run(shutdown).await;

    unregister(cli, &backend).await;
    Ok(())
}

fn gateway_client(cli: &Cli) -> Result<GatewayClient> {
    let url = match &cli.gateway_url {
        Some(url) => url,
        None => bail!("GATEWAY_URL is required for the {:?} role", cli.role),
    };
    GatewayClient::new(url).context("gateway client")
}

async fn register(cli: &Cli, backend: &BackendClient) -> Result<()> {
    retry_startup("node registration", || {
        backend.register_node(cli.node_type(), &cli.service_name, &cli.host, cli.port)
    })
    .await
}

async fn unregister(cli: &Cli, backend: &BackendClient) {
    if let Err(err) = backend.unregister_node(cli.node_type(), &cli.service_name).await {
        warn!("node unregistration failed: {err}");
    }
}

/// Run a startup call with fixed retries; failure after the last attempt
/// aborts startup.
async fn retry_startup<T, F, Fut>(what: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ndspipe::error::Result<T>>,
{
    let mut last = None;
    for attempt in 1..=STARTUP_RETRIES {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(attempt, "{what} failed: {err}");
                last = Some(err);
                if attempt < STARTUP_RETRIES {
                    tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(anyhow::anyhow!(
        "{what} failed after {STARTUP_RETRIES} attempts: {}",
        last.map(|err| err.to_string()).unwrap_or_default()
    ))
}
