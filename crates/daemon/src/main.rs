/// tordht daemon
///
/// Runs a content-provider host over Tor onion services:
/// - `provide` announces an identifier and keeps serving it
/// - `find` looks up providers of an identifier
/// - `serve` runs the host with the HTTP API
/// - `demo` runs two hosts over an in-memory network

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tordht_common::{DaemonConfig, DhtConfig, PeerEndpoint};
use tordht_core::{AnonSession, Context, DhtHost, KeyPair, MemoryNetwork, ProviderSet, TorSession};
use tordht_daemon::ApiServer;

#[derive(Parser)]
#[command(name = "tordht-daemon", version, about = "Content-provider discovery over Tor")]
struct Cli {
    /// Configuration file (TOML); defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    /// Bound on a single provide or lookup, in seconds
    #[arg(long, default_value = "120")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Announce an identifier, then keep serving it until Ctrl+C
    Provide { id: String },

    /// Find providers of an identifier
    Find {
        id: String,
        /// Maximum number of providers
        #[arg(long, default_value = "20")]
        max: usize,
        /// Bootstrap peer as `<service-id>:<port>/<peer-id>`; replaces the configured peers
        #[arg(long = "peer")]
        peers: Vec<PeerEndpoint>,
    },

    /// Run the host and the HTTP API until Ctrl+C
    Serve,

    /// Provide and find an identifier between two hosts on an in-memory network
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("Starting tordht daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            DaemonConfig::from_file(path)?
        }
        None => {
            info!("No configuration file given, using defaults");
            DaemonConfig::default()
        }
    };
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Command::Provide { id } => run_provide(config, &id, timeout).await,
        Command::Find { id, max, peers } => run_find(config, &id, max, peers, timeout).await,
        Command::Serve => run_serve(config, timeout).await,
        Command::Demo => run_demo(timeout).await,
    }
}

/// A context cancelled by Ctrl+C
fn interruptible() -> Context {
    let ctx = Context::background();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    ctx
}

async fn start_host(
    ctx: &Context,
    session: Arc<dyn AnonSession>,
    config: DhtConfig,
) -> Result<DhtHost> {
    let host = DhtHost::start(ctx, session, KeyPair::generate(), config)
        .await
        .context("Failed to start host")?;

    println!("Peer ID:   {}", host.local_peer_id());
    match host.peer_info() {
        Some(endpoint) => println!("Endpoint:  {}", endpoint),
        None => println!("Endpoint:  (client only)"),
    }
    Ok(host)
}

async fn connect_tor(config: &DaemonConfig) -> Result<Arc<TorSession>> {
    let session = TorSession::connect(config.tor.clone())
        .await
        .with_context(|| format!("Failed to connect to Tor at {}", config.tor.control_addr))?;
    Ok(Arc::new(session))
}

async fn shutdown(host: DhtHost, session: Arc<dyn AnonSession>) {
    host.close().await;
    if let Err(e) = session.close().await {
        warn!("Failed to close session: {}", e);
    }
}

async fn run_provide(config: DaemonConfig, id: &str, timeout: Duration) -> Result<()> {
    let session: Arc<dyn AnonSession> = connect_tor(&config).await?;
    let ctx = interruptible();
    let host = start_host(&ctx, session.clone(), config.dht).await?;

    let key = host
        .provide(&ctx.child_with_timeout(timeout), id)
        .await;
    match key {
        Ok(key) => println!("Providing {} as {}", id, key),
        Err(e) => {
            shutdown(host, session).await;
            return Err(e.into());
        }
    }

    info!("Serving. Press Ctrl+C to stop.");
    ctx.done().await;

    info!("Shutdown signal received");
    shutdown(host, session).await;
    Ok(())
}

async fn run_find(
    config: DaemonConfig,
    id: &str,
    max: usize,
    peers: Vec<PeerEndpoint>,
    timeout: Duration,
) -> Result<()> {
    let mut dht = config.dht.clone().client_only();
    if !peers.is_empty() {
        dht = dht.with_bootstrap_peers(peers);
    }

    let session: Arc<dyn AnonSession> = connect_tor(&config).await?;
    let ctx = interruptible();
    let host = start_host(&ctx, session.clone(), dht).await?;

    let found = host
        .find_providers(&ctx.child_with_timeout(timeout), id, max)
        .await;
    shutdown(host, session).await;

    print_providers(id, &found?);
    Ok(())
}

async fn run_serve(config: DaemonConfig, timeout: Duration) -> Result<()> {
    let session: Arc<dyn AnonSession> = connect_tor(&config).await?;
    let ctx = interruptible();
    let host = Arc::new(start_host(&ctx, session.clone(), config.dht).await?);

    let api_server = ApiServer::new(config.api_addr, host.clone(), timeout);
    let api = tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            warn!("API server error: {}", e);
        }
    });

    info!("Host is running. Press Ctrl+C to stop.");
    ctx.done().await;

    info!("Shutdown signal received");
    api.abort();
    host.close().await;
    if let Err(e) = session.close().await {
        warn!("Failed to close session: {}", e);
    }
    Ok(())
}

async fn run_demo(timeout: Duration) -> Result<()> {
    let memory = MemoryNetwork::new();
    memory.set_dial_latency(Duration::from_millis(50)).await;
    let ctx = interruptible();

    println!("Starting provider...");
    let provider = start_host(&ctx, Arc::new(memory.session()), DhtConfig::new()).await?;
    let endpoint = provider
        .peer_info()
        .cloned()
        .context("Provider has no endpoint")?;

    let key = provider
        .provide(&ctx.child_with_timeout(timeout), "demo")
        .await?;
    println!("Providing \"demo\" as {}", key);

    println!("\nStarting client...");
    let client_config = DhtConfig::new()
        .client_only()
        .with_bootstrap_peers(vec![endpoint])
        .with_min_peers(1);
    let client = start_host(&ctx, Arc::new(memory.session()), client_config).await?;

    let found = client
        .find_providers(&ctx.child_with_timeout(timeout), "demo", 10)
        .await?;
    print_providers("demo", &found);

    client.close().await;
    provider.close().await;
    Ok(())
}

fn print_providers(id: &str, found: &ProviderSet) {
    println!("\n========================================");
    println!("  Providers of {:?}", id);
    println!("========================================");
    if found.is_empty() {
        println!("  (none found)");
    }
    for endpoint in &found.endpoints {
        println!("  {}", endpoint);
    }
    for skipped in &found.undecodable {
        println!("  skipped {}: {}", skipped.peer_id.short_hex(), skipped.reason);
    }
    println!("========================================\n");
}
