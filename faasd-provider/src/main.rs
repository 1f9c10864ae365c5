use anyhow::Context;
use clap::Parser;
use ipnet::Ipv4Net;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use faasd_provider::config::{
    DEFAULT_NAMESPACE, NAMESPACE_LABEL, NAMESPACE_LABEL_VALUE, ProviderConfig, SCALE_READER_PATH,
    SCALE_UPDATER_PATH, WATCHDOG_PORT,
};
use faasd_provider::engine::memory::{DEFAULT_SUBNET, EngineSeed};
use faasd_provider::rest::{AppState, create_router};
use faasd_provider::{MemoryEngine, TaskResolver, WatchdogClient};

#[derive(Parser)]
#[command(name = "faasd-provider")]
#[command(about = "faasd provider - function replica status and scaling on containerd tasks")]
struct Args {
    /// Listen address for the REST API
    #[arg(short, long, env = "FAASD_LISTEN", default_value = "[::]:8081")]
    listen: String,

    /// Namespace used when a request names none
    #[arg(long, env = "FAASD_DEFAULT_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    default_namespace: String,

    /// Port the watchdog listens on inside each function
    #[arg(long, env = "FAASD_WATCHDOG_PORT", default_value_t = WATCHDOG_PORT)]
    watchdog_port: u16,

    /// Bound on a whole watchdog call in milliseconds
    #[arg(long, env = "FAASD_READ_TIMEOUT_MS", default_value_t = 10_000)]
    read_timeout_ms: u64,

    /// Watchdog connect timeout in milliseconds
    #[arg(long, env = "FAASD_CONNECT_TIMEOUT_MS", default_value_t = 3_000)]
    connect_timeout_ms: u64,

    /// Idle connections kept per watchdog
    #[arg(long, env = "FAASD_MAX_IDLE_CONNS_PER_HOST", default_value_t = 1024)]
    max_idle_conns_per_host: usize,

    /// How long idle watchdog connections are kept, in milliseconds
    #[arg(long, env = "FAASD_IDLE_CONN_TIMEOUT_MS", default_value_t = 120)]
    idle_conn_timeout_ms: u64,

    /// JSON file with namespaces and containers to start the engine with
    #[arg(long, env = "FAASD_SEED")]
    seed: Option<PathBuf>,

    /// Subnet function tasks get their addresses from
    #[arg(long, env = "FAASD_NETWORK_CIDR", default_value = DEFAULT_SUBNET)]
    network_cidr: Ipv4Net,
}

impl Args {
    fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            default_namespace: self.default_namespace.clone(),
            namespace_label: NAMESPACE_LABEL.to_string(),
            namespace_label_value: NAMESPACE_LABEL_VALUE.to_string(),
            watchdog_port: self.watchdog_port,
            read_path: SCALE_READER_PATH.to_string(),
            update_path: SCALE_UPDATER_PATH.to_string(),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_idle_conns_per_host: self.max_idle_conns_per_host,
            idle_conn_timeout: Duration::from_millis(self.idle_conn_timeout_ms),
        }
    }
}

async fn load_engine(args: &Args) -> anyhow::Result<MemoryEngine> {
    let Some(path) = &args.seed else {
        return Ok(MemoryEngine::new(args.network_cidr));
    };

    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read seed {}", path.display()))?;
    let seed: EngineSeed = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse seed {}", path.display()))?;
    info!(
        "Seeding engine with {} namespaces and {} containers from {}",
        seed.namespaces.len(),
        seed.containers.len(),
        path.display()
    );
    Ok(MemoryEngine::from_seed(seed, args.network_cidr)?)
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c.await.ok();
            info!("Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("faasd_provider=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(args.provider_config());

    let engine = Arc::new(load_engine(&args).await?);
    let proxy = WatchdogClient::new(&config).context("Failed to build watchdog client")?;

    let state = Arc::new(AppState::new(
        config.clone(),
        engine.clone(),
        Arc::new(TaskResolver::new(engine)),
        Arc::new(proxy),
    ));
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(
        "faasd provider listening on {} (default namespace {}, watchdog port {})",
        args.listen, config.default_namespace, config.watchdog_port
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Shutdown complete");
    Ok(())
}
