//! azure-vnet-ipam-cni - CNI IPAM plugin for Azure virtual networks.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{debug, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vnet_ipam_cni::{
    CniCommand, CniError, CniPlugin, DEFAULT_CNI_VERSION, NetworkConfig, Result, VersionResult,
};
use vnet_ipam_store::{JsonFileStore, KeyValueStore};

#[derive(Parser)]
#[command(name = "azure-vnet-ipam-cni")]
#[command(about = "CNI IPAM plugin for Azure virtual networks")]
#[command(version)]
struct Cli {
    /// Operation to perform
    #[arg(long, env = "CNI_COMMAND")]
    command: CniCommand,

    /// Container the operation applies to
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    container_id: String,

    /// Network namespace of the container
    #[arg(long, env = "CNI_NETNS", default_value = "")]
    netns: String,

    /// Interface name inside the container
    #[arg(long, env = "CNI_IFNAME", default_value = "")]
    ifname: String,

    /// Plugin search path
    #[arg(long, env = "CNI_PATH", default_value = "")]
    cni_path: String,

    /// File holding persisted IPAM state
    #[arg(long, env = "AZURE_VNET_IPAM_STORE_FILE", default_value = "/var/run/azure-vnet-ipam.json")]
    store_file: PathBuf,
}

fn main() -> ExitCode {
    // stdout carries the result object, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vnet_ipam=info,vnet_ipam_cni=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let err = CniError::InvalidEnvironment(e.to_string());
            return report(DEFAULT_CNI_VERSION, &err);
        }
        Err(e) => {
            // --help and --version
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return report(DEFAULT_CNI_VERSION, &CniError::Io(e.to_string())),
    };

    let mut stdin = Vec::new();
    if cli.command != CniCommand::Version {
        if let Err(e) = std::io::stdin().read_to_end(&mut stdin) {
            return report(DEFAULT_CNI_VERSION, &CniError::Io(e.to_string()));
        }
    }

    let config = if stdin.iter().all(u8::is_ascii_whitespace) {
        NetworkConfig::default()
    } else {
        match NetworkConfig::parse(&stdin) {
            Ok(config) => config,
            Err(e) => return report(DEFAULT_CNI_VERSION, &e),
        }
    };
    let version = config.cni_version().to_string();

    match runtime.block_on(execute(&cli, config)) {
        Ok(Some(output)) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => report(&version, &e),
    }
}

/// Runs one command and returns the JSON to print, if any.
async fn execute(cli: &Cli, config: NetworkConfig) -> Result<Option<String>> {
    debug!(
        command = %cli.command,
        container = %cli.container_id,
        netns = %cli.netns,
        ifname = %cli.ifname,
        path = %cli.cni_path,
        "CNI invocation"
    );

    match cli.command {
        CniCommand::Version => {
            return encode(&VersionResult::new(config.cni_version())).map(Some);
        }
        CniCommand::Check => return Ok(None),
        CniCommand::Add | CniCommand::Del => {}
    }
    if cli.container_id.is_empty() {
        return Err(CniError::InvalidEnvironment(
            "CNI_CONTAINERID is required".to_string(),
        ));
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&cli.store_file));
    let lock_store = Arc::clone(&store);
    tokio::task::spawn_blocking(move || lock_store.lock(true))
        .await
        .map_err(|e| CniError::Io(e.to_string()))??;

    let outcome = run(cli, config, Arc::clone(&store)).await;

    if let Err(e) = store.unlock() {
        warn!(error = %e, "failed to unlock IPAM store");
    }
    outcome
}

async fn run(
    cli: &Cli,
    config: NetworkConfig,
    store: Arc<dyn KeyValueStore>,
) -> Result<Option<String>> {
    let plugin = CniPlugin::start(store, config, None).await?;
    let outcome = match cli.command {
        CniCommand::Add => plugin
            .add(&cli.container_id)
            .await
            .and_then(|result| encode(&result))
            .map(Some),
        _ => plugin.del(&cli.container_id).await.map(|()| None),
    };
    plugin.stop().await;
    outcome
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn report(cni_version: &str, err: &CniError) -> ExitCode {
    error!(code = err.code(), error = %err, "CNI command failed");
    match serde_json::to_string(&err.to_output(cni_version)) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "failed to encode CNI error"),
    }
    ExitCode::FAILURE
}
