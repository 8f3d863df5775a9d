//! azure-vnet-ipam - libnetwork remote IPAM plugin for Azure virtual networks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vnet_ipam::{AddressManager, Environment, ManagerOptions, SourceConfig};
use vnet_ipam_libnetwork::{
    DEFAULT_PLUGIN_SPEC_DIR, IpamDriver, ListenAddress, PluginListener, PluginSpecFile,
};
use vnet_ipam_store::{JsonFileStore, KeyValueStore};

#[derive(Parser)]
#[command(name = "azure-vnet-ipam")]
#[command(about = "Docker IPAM plugin for Azure virtual networks")]
#[command(version)]
struct Cli {
    /// Address source: azure, mas, fileIpam, ipv6NodeIpam or null
    #[arg(long, env = "AZURE_VNET_IPAM_ENVIRONMENT", default_value = "azure")]
    environment: Environment,

    /// Endpoint to serve the plugin API on (unix:// or tcp://)
    #[arg(
        long,
        env = "AZURE_VNET_IPAM_LISTEN_URL",
        default_value = "unix:///run/docker/plugins/azure-vnet-ipam.sock"
    )]
    listen_url: String,

    /// File holding persisted IPAM state
    #[arg(
        long,
        env = "AZURE_VNET_IPAM_STORE_FILE",
        default_value = "/var/run/azure-vnet-ipam.json"
    )]
    store_file: PathBuf,

    /// Override for the address source endpoint
    #[arg(long, env = "AZURE_VNET_IPAM_QUERY_URL")]
    ipam_query_url: Option<String>,

    /// Seconds between address source queries
    #[arg(long, env = "AZURE_VNET_IPAM_QUERY_INTERVAL")]
    ipam_query_interval: Option<u64>,

    /// Plugin name Docker refers to
    #[arg(long, default_value = "azure-vnet-ipam")]
    plugin_name: String,

    /// Directory for the plugin spec file of TCP endpoints
    #[arg(long, default_value = DEFAULT_PLUGIN_SPEC_DIR)]
    plugin_spec_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("vnet_ipam=info".parse()?)
                .add_directive("vnet_ipam_libnetwork=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    info!(
        environment = %cli.environment,
        listen_url = %cli.listen_url,
        store = %cli.store_file.display(),
        "starting azure-vnet-ipam"
    );

    let address = ListenAddress::parse(&cli.listen_url)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&cli.store_file));
    store.lock(true).context("failed to lock IPAM store")?;

    let result = run(&cli, address, Arc::clone(&store)).await;

    if let Err(e) = store.unlock() {
        warn!(error = %e, "failed to unlock IPAM store");
    }
    if let Err(e) = &result {
        error!(error = %e, "azure-vnet-ipam exited with error");
    }
    result
}

async fn run(cli: &Cli, address: ListenAddress, store: Arc<dyn KeyValueStore>) -> anyhow::Result<()> {
    let manager = AddressManager::initialize(
        store,
        ManagerOptions {
            rehydrate_on_reboot: true,
            ..ManagerOptions::default()
        },
    )
    .context("failed to initialize address manager")?;
    let manager = Arc::new(manager);

    let source = SourceConfig {
        environment: cli.environment,
        query_url: cli.ipam_query_url.clone(),
        query_interval: cli.ipam_query_interval,
        ..SourceConfig::default()
    };
    manager
        .start_source(&source)
        .await
        .context("failed to start address source")?;

    let listener = PluginListener::bind(&address).await?;
    let spec = match &address {
        ListenAddress::Tcp(_) => Some(PluginSpecFile::write(
            &cli.plugin_spec_dir,
            &cli.plugin_name,
            &listener.local_url(),
        )?),
        ListenAddress::Unix(_) => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let driver = Arc::new(IpamDriver::new(Arc::clone(&manager)));
    let served = listener.serve(driver, shutdown_rx).await;

    if let Some(spec) = spec {
        spec.remove();
    }
    manager.uninitialize().await;
    info!("azure-vnet-ipam stopped");
    served.map_err(Into::into)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
