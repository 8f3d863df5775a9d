//! CNI command handling on top of the address manager.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{info, warn};
use vnet_ipam::{
    AddressManager, InterfaceLister, ManagerOptions, OPT_ADDRESS_ID, OPT_INTERFACE_NAME, Options,
};
use vnet_ipam_store::KeyValueStore;

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::result::IpamResult;

/// The operation requested through `CNI_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    /// Allocate an address for a container.
    Add,
    /// Release a container's address.
    Del,
    /// Verify a container's address.
    Check,
    /// Report supported versions.
    Version,
}

impl FromStr for CniCommand {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            "VERSION" => Ok(Self::Version),
            other => Err(format!("unknown CNI command {other:?}")),
        }
    }
}

impl fmt::Display for CniCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
            Self::Check => "CHECK",
            Self::Version => "VERSION",
        })
    }
}

/// An address manager set up from one network configuration.
#[derive(Debug)]
pub struct CniPlugin {
    manager: AddressManager,
    config: NetworkConfig,
}

impl CniPlugin {
    /// Restores state from `store` and starts the configured address source.
    pub async fn start(
        store: Arc<dyn KeyValueStore>,
        config: NetworkConfig,
        interfaces: Option<Arc<dyn InterfaceLister>>,
    ) -> Result<Self> {
        let source = config.source_config()?;
        let manager = AddressManager::initialize(
            store,
            ManagerOptions {
                interfaces,
                ..ManagerOptions::default()
            },
        )?;
        manager.start_source(&source).await?;
        Ok(Self { manager, config })
    }

    /// Stops the address source.
    pub async fn stop(&self) {
        self.manager.uninitialize().await;
    }

    /// Leases an address for `container_id`. Without a configured subnet a
    /// pool is reserved first, preferring pools on the `master` interface.
    pub async fn add(&self, container_id: &str) -> Result<IpamResult> {
        let as_id = self.config.address_space();

        let mut reserved = None;
        let subnet = if self.config.ipam.subnet.is_empty() {
            let mut options = Options::new();
            if !self.config.master.is_empty() {
                options.insert(OPT_INTERFACE_NAME.to_string(), self.config.master.clone());
            }
            let (pool, subnet) = self
                .manager
                .request_pool(as_id, "", "", &options, self.config.wants_ipv6())
                .await?;
            reserved = Some(pool);
            subnet
        } else {
            self.config.ipam.subnet.clone()
        };

        match self.lease(as_id, &subnet, container_id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Some(pool) = reserved {
                    if let Err(release) = self.manager.release_pool(as_id, &pool).await {
                        warn!(pool = %pool, error = %release, "failed to release pool after failed ADD");
                    }
                }
                Err(e)
            }
        }
    }

    async fn lease(&self, as_id: &str, subnet: &str, container_id: &str) -> Result<IpamResult> {
        let address = self
            .manager
            .request_address(as_id, subnet, &self.config.ipam.ip_address, &lease_options(container_id))
            .await?;
        let info = self.manager.get_pool_info(as_id, subnet).await?;
        info!(container = container_id, %address, pool = subnet, "address allocated");
        IpamResult::new(self.config.cni_version(), &address, &info)
    }

    /// Releases the lease held by `container_id`, or the configured pool
    /// when no address is known.
    pub async fn del(&self, container_id: &str) -> Result<()> {
        let as_id = self.config.address_space();
        let address = if self.config.ipam.ip_address.is_empty() {
            self.config.previous_address().unwrap_or_default()
        } else {
            self.config.ipam.ip_address.clone()
        };
        let subnet = if self.config.ipam.subnet.is_empty() {
            address
                .parse::<IpNet>()
                .map(|net| net.trunc().to_string())
                .unwrap_or_default()
        } else {
            self.config.ipam.subnet.clone()
        };

        if subnet.is_empty() {
            info!(container = container_id, "nothing to release");
            return Ok(());
        }
        if address.is_empty() {
            self.manager.release_pool(as_id, &subnet).await?;
            info!(pool = %subnet, "pool released");
        } else {
            self.manager
                .release_address(as_id, &subnet, &address, &lease_options(container_id))
                .await?;
            info!(container = container_id, %address, "address released");
        }
        Ok(())
    }
}

fn lease_options(container_id: &str) -> Options {
    let mut options = Options::new();
    if !container_id.is_empty() {
        options.insert(OPT_ADDRESS_ID.to_string(), container_id.to_string());
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("ADD", CniCommand::Add ; "add")]
    #[test_case("DEL", CniCommand::Del ; "del")]
    #[test_case("CHECK", CniCommand::Check ; "check")]
    #[test_case("VERSION", CniCommand::Version ; "version")]
    fn test_command_parse(raw: &str, expected: CniCommand) {
        let parsed: CniCommand = raw.parse().expect("parse");
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), raw);
    }

    #[test]
    fn test_command_parse_rejects_lowercase() {
        assert!("add".parse::<CniCommand>().is_err());
    }

    #[test]
    fn test_lease_options() {
        assert!(lease_options("").is_empty());
        assert_eq!(lease_options("abc")[OPT_ADDRESS_ID], "abc");
    }
}
