use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;

use larb::core::{Context, ContextOptions, Store};
use larb::ipvs::IpvsadmDriver;
use larb::vip;

#[derive(Parser)]
#[command(name = "larb")]
#[command(version)]
#[command(about = "Control-plane daemon for the in-kernel IPVS layer-4 load balancer")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Default interface to bind services on
    #[arg(short = 'i', long, default_value = "eth0")]
    device: String,

    /// Flush IPVS pools on start
    #[arg(short, long)]
    flush: bool,

    /// Endpoint the daemon's API is served on, announced via discovery
    #[arg(short, long, default_value = ":4672")]
    listen: String,

    /// URL of the Consul HTTP API for discovery announcements
    #[arg(short, long)]
    consul: Option<String>,

    /// Interface to add VIP aliases on
    #[arg(long)]
    vip_interface: Option<String>,

    /// Comma-delimited list of store URLs to sync desired state from.
    /// All URLs must share one scheme and one path.
    #[arg(long)]
    store: Option<String>,

    /// Use TLS when connecting to the store backend
    #[arg(long)]
    store_use_tls: bool,

    /// Store sync period in seconds
    #[arg(long, default_value_t = 60)]
    store_sync_time: u64,

    /// Key prefix for service documents
    #[arg(long, default_value = "services")]
    store_service_path: String,

    /// Key prefix for backend documents
    #[arg(long, default_value = "backends")]
    store_backend_path: String,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// Port part of a `host:port` or `:port` endpoint string.
fn listen_port(listen: &str) -> anyhow::Result<u16> {
    let (_, port) = listen
        .rsplit_once(':')
        .with_context(|| format!("no port in listen endpoint '{listen}'"))?;
    port.parse()
        .with_context(|| format!("bad port in listen endpoint '{listen}'"))
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to wait for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!(version = env!("CARGO_PKG_VERSION"), "starting larb daemon");

    let endpoints = vip::interface_ips(&cli.device)
        .await
        .with_context(|| format!("error while obtaining addresses of '{}'", cli.device))?;
    let listen_port = listen_port(&cli.listen)?;

    let ctx = Context::new(
        ContextOptions {
            disco: cli.consul.clone(),
            endpoints,
            flush: cli.flush,
            listen_port,
            vip_interface: cli.vip_interface.clone(),
        },
        Arc::new(IpvsadmDriver::new()),
    )
    .await
    .context("error while initializing the IPVS context")?;

    let store = match &cli.store {
        Some(urls) if !urls.is_empty() => {
            let urls: Vec<String> = urls.split(',').map(str::to_string).collect();
            let store = Store::new(
                Arc::clone(&ctx),
                &urls,
                &cli.store_service_path,
                &cli.store_backend_path,
                cli.store_sync_time,
                cli.store_use_tls,
            )
            .await
            .context("error while initializing the external store sync")?;
            Some(store)
        }
        _ => None,
    };

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");

    if let Some(store) = &store {
        store.close();
    }
    ctx.close().await;

    Ok(())
}
