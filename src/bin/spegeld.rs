//! Spegel daemon binary

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use url::Url;

use spegel::advertiser::Advertiser;
use spegel::config::SpegelConfig;
use spegel::oci::FsStore;
use spegel::registry::{self, RegistryConfig, RegistryState};
use spegel::routing::{AddressPolicy, P2pRouter, Router, StaticBootstrapper};
use spegel::{init_tracing, metrics, mirror, Error};

#[derive(Parser)]
#[command(name = "spegeld")]
#[command(about = "Peer-to-peer pull-through mirror for OCI registries")]
struct Cli {
    /// Registry listen address
    #[arg(long)]
    registry_addr: Option<String>,

    /// DHT listen address
    #[arg(long)]
    router_addr: Option<String>,

    /// Metrics listen address
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Address clients use to reach this node's registry
    #[arg(long)]
    local_addr: Option<String>,

    /// OCI image layout directory of the local content store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Containerd registry configuration directory
    #[arg(long)]
    containerd_config_path: Option<PathBuf>,

    /// Upstream registries to mirror (comma-separated URLs)
    #[arg(long)]
    registries: Option<String>,

    /// Multiaddress of an existing peer; omit on the first node
    #[arg(long)]
    bootstrap: Option<String>,

    /// Serve references with the `latest` tag
    #[arg(long)]
    resolve_latest_tag: Option<bool>,

    /// Pace blob writes at this rate (e.g. 100MB)
    #[arg(long)]
    blob_speed: Option<String>,

    /// Admit loopback peer addresses (single-host setups)
    #[arg(long)]
    allow_loopback: bool,
}

#[tokio::main]
async fn main() -> spegel::Result<()> {
    let cli = Cli::parse();

    init_tracing()?;

    let mut config = SpegelConfig::load()?;
    if let Some(registry_addr) = cli.registry_addr {
        config.registry_addr = registry_addr;
    }
    if let Some(router_addr) = cli.router_addr {
        config.router_addr = router_addr;
    }
    if let Some(metrics_addr) = cli.metrics_addr {
        config.metrics_addr = metrics_addr;
    }
    if let Some(local_addr) = cli.local_addr {
        config.local_addr = local_addr;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(containerd_config_path) = cli.containerd_config_path {
        config.containerd_config_path = containerd_config_path;
    }
    if let Some(registries) = cli.registries {
        config.registries = registries.split(',').map(|s| s.trim().to_owned()).collect();
    }
    if let Some(bootstrap) = cli.bootstrap {
        config.bootstrap_peer = Some(bootstrap);
    }
    if let Some(resolve_latest_tag) = cli.resolve_latest_tag {
        config.resolve_latest_tag = resolve_latest_tag;
    }
    if let Some(blob_speed) = cli.blob_speed {
        config.blob_speed = Some(blob_speed.parse()?);
    }

    info!(version = spegel::VERSION, "starting spegeld");
    info!(registry = %config.registry_addr, router = %config.router_addr, data_dir = %config.data_dir.display(), "configuration");

    // Point the runtime at the local mirror for each configured upstream.
    let registry_urls = config
        .registries
        .iter()
        .map(|raw| Url::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let local_registry_url = Url::parse(&format!(
        "http://{}",
        if config.local_addr.is_empty() {
            &config.registry_addr
        } else {
            &config.local_addr
        }
    ))?;
    mirror::add_mirror_configuration(
        &config.containerd_config_path,
        &registry_urls,
        &[local_registry_url],
    )
    .await?;

    let bootstrap_peer = config
        .bootstrap_peer
        .as_deref()
        .map(|addr| addr.parse::<libp2p::Multiaddr>())
        .transpose()?;
    let bootstrapper = StaticBootstrapper::new(bootstrap_peer);
    let policy = AddressPolicy {
        allow_loopback: cli.allow_loopback,
    };
    let router = Arc::new(P2pRouter::new(&config.router_addr, &bootstrapper, policy).await?);
    info!(peer = %router.local_multiaddr(), "p2p router started");

    let store = Arc::new(FsStore::new(&config.data_dir));

    let advertiser = Advertiser::new(
        store.clone(),
        router.clone(),
        config.refresh_period(),
        config.resolve_latest_tag,
    );
    tokio::spawn(advertiser.run(None));

    let registry_port = config
        .registry_addr
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| Error::malformed(format!("registry address: {}", config.registry_addr)))?;
    let state = RegistryState::new(
        store,
        router.clone(),
        RegistryConfig {
            local_addr: config.local_addr.clone(),
            registry_port,
            resolve_retries: config.resolve_retries,
            resolve_timeout: config.resolve_timeout(),
            resolve_latest_tag: config.resolve_latest_tag,
            blob_speed: config.blob_speed,
        },
    )?;

    let metrics_listener = tokio::net::TcpListener::bind(&config.metrics_addr).await?;
    tokio::spawn(async move {
        if let Err(err) = metrics::serve(metrics_listener).await {
            tracing::error!(error = %err, "metrics server exited");
        }
    });

    let registry_listener = tokio::net::TcpListener::bind(&config.registry_addr).await?;
    tokio::select! {
        result = registry::serve(registry_listener, state) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    router.close();
    Ok(())
}
