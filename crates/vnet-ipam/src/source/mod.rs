//! Address sources: pluggable producers of address-space snapshots.
//!
//! A source discovers the addresses available to this host and hands the
//! result to an [`AddressConfigSink`], which merges it into live state.
//! Sources are driven by the manager; each decides on its own whether a
//! refresh is due.

mod discovery;
mod file;
mod ipv6_node;
mod null;
mod wireserver;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{IpamError, Result};
use crate::platform::InterfaceLister;
use crate::space::{AddressScope, AddressSpace};

pub use file::FileSource;
pub use ipv6_node::{
    IPV6_MASK_LEN_RANGE, Ipv6NodeSource, KubeNodeClient, MIN_KUBERNETES_VERSION, NodeClient,
};
pub use null::NullSource;
pub use wireserver::{DEFAULT_WIRESERVER_URL, WireserverSource};

/// Default interval between wireserver queries.
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(10);

/// Default prefix length of the pool carved from a node's IPv6 pod CIDR.
pub const DEFAULT_IPV6_MASK_LEN: u8 = 120;

/// Default host interface for the IPv6 node pool.
pub const DEFAULT_IPV6_INTERFACE: &str = "eth0";

/// Receives snapshots built by a source.
pub trait AddressConfigSink {
    /// Creates an empty space for a source to populate.
    fn new_address_space(&self, id: &str, scope: AddressScope) -> Result<AddressSpace>;

    /// Merges a populated space into live state.
    fn set_address_space(&mut self, space: AddressSpace) -> Result<()>;
}

/// The environment the host runs in, which selects the address source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Environment {
    /// No source; pools come only from persisted state.
    #[default]
    #[serde(rename = "")]
    None,
    /// Azure VM; addresses come from the wireserver.
    #[serde(rename = "azure")]
    Azure,
    /// Azure Stack; addresses come from the interfaces file.
    #[serde(rename = "mas")]
    Mas,
    /// Addresses come from the interfaces file.
    #[serde(rename = "fileIpam")]
    FileIpam,
    /// Kubernetes node; addresses come from the node's IPv6 pod CIDR.
    #[serde(rename = "ipv6NodeIpam")]
    Ipv6NodeIpam,
    /// A single catch-all pool with no addresses.
    #[serde(rename = "null")]
    Null,
}

impl Environment {
    /// Configuration spelling of the environment.
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::None => "",
            Environment::Azure => "azure",
            Environment::Mas => "mas",
            Environment::FileIpam => "fileIpam",
            Environment::Ipv6NodeIpam => "ipv6NodeIpam",
            Environment::Null => "null",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(Environment::None),
            "azure" => Ok(Environment::Azure),
            "mas" => Ok(Environment::Mas),
            "fileIpam" => Ok(Environment::FileIpam),
            "ipv6NodeIpam" => Ok(Environment::Ipv6NodeIpam),
            "null" => Ok(Environment::Null),
            other => Err(IpamError::InvalidConfiguration(format!(
                "unknown environment {other:?}"
            ))),
        }
    }
}

/// Settings for the address source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceConfig {
    /// Which source to run.
    pub environment: Environment,
    /// Wireserver endpoint override.
    pub query_url: Option<String>,
    /// Seconds between wireserver queries.
    pub query_interval: Option<u64>,
    /// Interfaces file override for the file source.
    pub file_path: Option<PathBuf>,
    /// Kubernetes node name; defaults to the host name.
    pub node_name: Option<String>,
    /// Host interface that owns the IPv6 node pool.
    pub interface_name: Option<String>,
    /// Prefix length of the IPv6 node pool.
    pub ipv6_mask_len: Option<u8>,
}

impl SourceConfig {
    /// Creates a config for `environment` with all other settings defaulted.
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            ..Self::default()
        }
    }

    /// Checks the settings for consistency.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.query_url {
            url::Url::parse(url).map_err(|e| {
                IpamError::InvalidConfiguration(format!("invalid query URL {url:?}: {e}"))
            })?;
        }
        if let Some(len) = self.ipv6_mask_len {
            if !IPV6_MASK_LEN_RANGE.contains(&len) {
                return Err(IpamError::InvalidConfiguration(format!(
                    "IPv6 pool prefix length {len} must be between {} and {}",
                    IPV6_MASK_LEN_RANGE.start(),
                    IPV6_MASK_LEN_RANGE.end()
                )));
            }
        }
        if matches!(&self.interface_name, Some(name) if name.is_empty()) {
            return Err(IpamError::InvalidConfiguration(
                "interface name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between wireserver queries.
    pub fn query_interval(&self) -> Duration {
        self.query_interval
            .map_or(DEFAULT_QUERY_INTERVAL, Duration::from_secs)
    }
}

/// Rate limiter for periodic sources.
#[derive(Debug)]
pub(crate) struct RefreshTimer {
    interval: Duration,
    last: Option<Instant>,
}

impl RefreshTimer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns whether a refresh is due, and if so records it as started.
    pub(crate) fn start_if_due(&mut self) -> bool {
        let due = self
            .last
            .is_none_or(|last| last.elapsed() >= self.interval);
        if due {
            self.last = Some(Instant::now());
        }
        due
    }
}

/// The running address source.
#[derive(Debug)]
pub enum AddressSource {
    /// Azure wireserver.
    Wireserver(WireserverSource),
    /// Interfaces file.
    File(FileSource),
    /// Kubernetes node IPv6 pod CIDR.
    Ipv6Node(Ipv6NodeSource),
    /// Catch-all pool.
    Null(NullSource),
}

impl AddressSource {
    /// Builds the source selected by `config`, or `None` if no source is
    /// configured.
    pub async fn from_config(
        config: &SourceConfig,
        interfaces: Arc<dyn InterfaceLister>,
    ) -> Result<Option<Self>> {
        config.validate()?;
        let source = match config.environment {
            Environment::None => return Ok(None),
            Environment::Azure => Self::Wireserver(WireserverSource::new(
                config.query_url.as_deref(),
                config.query_interval(),
                interfaces,
            )?),
            Environment::Mas | Environment::FileIpam => Self::File(FileSource::new(
                config.file_path.clone(),
                interfaces,
            )),
            Environment::Ipv6NodeIpam => {
                let node_name = match &config.node_name {
                    Some(name) => name.clone(),
                    None => hostname::get()
                        .map_err(|e| {
                            IpamError::InvalidConfiguration(format!(
                                "failed to read host name: {e}"
                            ))
                        })?
                        .to_string_lossy()
                        .into_owned(),
                };
                Self::Ipv6Node(Ipv6NodeSource::new(
                    KubeNodeClient::try_default().await?,
                    node_name,
                    config.interface_name.as_deref().unwrap_or(DEFAULT_IPV6_INTERFACE),
                    config.ipv6_mask_len.unwrap_or(DEFAULT_IPV6_MASK_LEN),
                ))
            }
            Environment::Null => Self::Null(NullSource::new()),
        };
        info!(environment = %config.environment, source = source.name(), "address source configured");
        Ok(Some(source))
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Wireserver(_) => "wireserver",
            Self::File(_) => "file",
            Self::Ipv6Node(_) => "ipv6-node",
            Self::Null(_) => "null",
        }
    }

    /// Prepares the source. Failures here are fatal to the caller.
    pub async fn start(&mut self) -> Result<()> {
        match self {
            Self::Wireserver(s) => s.start(),
            Self::File(_) | Self::Null(_) => Ok(()),
            Self::Ipv6Node(s) => s.start().await,
        }
    }

    /// Releases the source's resources.
    pub fn stop(&mut self) {
        if let Self::Wireserver(s) = self {
            s.stop();
        }
        info!(source = self.name(), "address source stopped");
    }

    /// Pushes a fresh snapshot into `sink` if one is due.
    pub async fn refresh<K: AddressConfigSink + Send>(&mut self, sink: &mut K) -> Result<()> {
        match self {
            Self::Wireserver(s) => s.refresh(sink).await,
            Self::File(s) => s.refresh(sink).await,
            Self::Ipv6Node(s) => s.refresh(sink).await,
            Self::Null(s) => s.refresh(sink),
        }
    }
}
