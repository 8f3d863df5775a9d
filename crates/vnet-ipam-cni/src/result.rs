//! CNI result objects written to stdout.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::Serialize;
use vnet_ipam::{IpamError, PoolInfo};

use crate::error::{CniError, Result};

/// Result format versions this plugin can emit.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// The result of a successful ADD.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct IpamResult {
    /// Result format version.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Assigned addresses.
    pub ips: Vec<IpConfig>,
    /// Routes to install.
    pub routes: Vec<Route>,
    /// Resolver settings.
    pub dns: Dns,
}

/// One assigned address.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct IpConfig {
    /// Address family, only present in pre-1.0 results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Address in CIDR form.
    pub address: String,
    /// Default gateway.
    pub gateway: IpAddr,
}

/// A route.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Route {
    /// Destination prefix.
    pub dst: IpNet,
    /// Next hop.
    pub gw: IpAddr,
}

/// Resolver settings.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Dns {
    /// Name servers.
    pub nameservers: Vec<IpAddr>,
}

impl IpamResult {
    /// Builds the result for `address` leased from the pool described by `info`.
    pub fn new(cni_version: &str, address: &str, info: &PoolInfo) -> Result<Self> {
        let cidr: IpNet = address
            .parse()
            .map_err(|_| CniError::Ipam(IpamError::InvalidAddress))?;
        let default_route = match cidr {
            IpNet::V4(_) => IpNet::V4(ipnet::Ipv4Net::default()),
            IpNet::V6(_) => IpNet::V6(ipnet::Ipv6Net::default()),
        };
        let version = cni_version.starts_with("0.").then(|| {
            if cidr.addr().is_ipv4() { "4" } else { "6" }.to_string()
        });

        Ok(Self {
            cni_version: cni_version.to_string(),
            ips: vec![IpConfig {
                version,
                address: address.to_string(),
                gateway: info.gateway,
            }],
            routes: vec![Route {
                dst: default_route,
                gw: info.gateway,
            }],
            dns: Dns {
                nameservers: info.dns_servers.clone(),
            },
        })
    }
}

/// Output of the VERSION command.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct VersionResult {
    /// Version of this object's format.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Result versions the plugin supports.
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl VersionResult {
    /// Lists [`SUPPORTED_VERSIONS`].
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vnet_ipam::DNS_PROXY;

    fn info(subnet: &str, gateway: &str) -> PoolInfo {
        PoolInfo {
            subnet: subnet.parse().expect("subnet"),
            gateway: gateway.parse().expect("gateway"),
            dns_servers: vec![DNS_PROXY],
            is_ipv6: subnet.contains(':'),
            capacity: 1,
            available: 0,
            unhealthy_addresses: vec![],
        }
    }

    #[test]
    fn test_ipv4_result() {
        let result =
            IpamResult::new("0.4.0", "10.0.0.5/16", &info("10.0.0.0/16", "10.0.0.1")).expect("result");
        assert_eq!(
            serde_json::to_value(&result).expect("encode"),
            json!({
                "cniVersion": "0.4.0",
                "ips": [{"version": "4", "address": "10.0.0.5/16", "gateway": "10.0.0.1"}],
                "routes": [{"dst": "0.0.0.0/0", "gw": "10.0.0.1"}],
                "dns": {"nameservers": ["168.63.129.16"]}
            })
        );
    }

    #[test]
    fn test_ipv6_result_v1() {
        let result = IpamResult::new(
            "1.0.0",
            "fd00::5/120",
            &info("fd00::/120", "fd00::1"),
        )
        .expect("result");
        let json = serde_json::to_value(&result).expect("encode");
        assert!(json["ips"][0].get("version").is_none());
        assert_eq!(json["routes"][0]["dst"], "::/0");
    }

    #[test]
    fn test_malformed_address() {
        assert!(IpamResult::new("0.4.0", "bogus", &info("10.0.0.0/16", "10.0.0.1")).is_err());
    }

    #[test]
    fn test_version_result() {
        let json = serde_json::to_value(VersionResult::new("1.0.0")).expect("encode");
        assert_eq!(json["supportedVersions"].as_array().expect("array").len(), 6);
    }
}
