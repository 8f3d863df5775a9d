//! Interface discovery documents shared by the wireserver and file sources.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{IpamError, Result};
use crate::platform::{HostInterface, normalize_mac};
use crate::pool::{PRIORITY_PRIMARY, PRIORITY_SECONDARY};
use crate::space::AddressSpace;

/// MAC address that matches the first host interface.
const ANY_MAC: &str = "*";

/// One interface as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoveredInterface {
    pub mac: String,
    pub is_primary: bool,
    pub subnets: Vec<DiscoveredSubnet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoveredSubnet {
    pub prefix: String,
    pub addresses: Vec<DiscoveredAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoveredAddress {
    pub address: String,
    pub is_primary: bool,
}

// Wireserver XML:
// <Interfaces><Interface MacAddress=".." IsPrimary="true">
//   <IPSubnet Prefix="10.0.0.0/16"><IPAddress Address="10.0.0.4" IsPrimary="true"/>..

#[derive(Debug, Deserialize)]
struct XmlInterfaces {
    #[serde(rename = "Interface", default)]
    interfaces: Vec<XmlInterface>,
}

#[derive(Debug, Deserialize)]
struct XmlInterface {
    #[serde(rename = "@MacAddress")]
    mac_address: String,
    #[serde(rename = "@IsPrimary", default)]
    is_primary: bool,
    #[serde(rename = "IPSubnet", default)]
    subnets: Vec<XmlSubnet>,
}

#[derive(Debug, Deserialize)]
struct XmlSubnet {
    #[serde(rename = "@Prefix")]
    prefix: String,
    #[serde(rename = "IPAddress", default)]
    addresses: Vec<XmlAddress>,
}

#[derive(Debug, Deserialize)]
struct XmlAddress {
    #[serde(rename = "@Address")]
    address: String,
    #[serde(rename = "@IsPrimary", default)]
    is_primary: bool,
}

/// Parses the wireserver's interface XML.
pub(crate) fn parse_interfaces_xml(xml: &str) -> Result<Vec<DiscoveredInterface>> {
    let doc: XmlInterfaces = quick_xml::de::from_str(xml)
        .map_err(|e| IpamError::Source(format!("malformed interface XML: {e}")))?;
    Ok(doc
        .interfaces
        .into_iter()
        .map(|iface| DiscoveredInterface {
            mac: iface.mac_address,
            is_primary: iface.is_primary,
            subnets: iface
                .subnets
                .into_iter()
                .map(|subnet| DiscoveredSubnet {
                    prefix: subnet.prefix,
                    addresses: subnet
                        .addresses
                        .into_iter()
                        .map(|a| DiscoveredAddress {
                            address: a.address,
                            is_primary: a.is_primary,
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonInterfaces {
    #[serde(default)]
    interfaces: Vec<JsonInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonInterface {
    mac_address: String,
    #[serde(default)]
    is_primary: bool,
    #[serde(rename = "IPSubnets", default)]
    ip_subnets: Vec<JsonSubnet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonSubnet {
    prefix: String,
    #[serde(rename = "IPAddresses", default)]
    ip_addresses: Vec<JsonAddress>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonAddress {
    address: String,
    #[serde(default)]
    is_primary: bool,
}

/// Parses the interfaces file JSON.
pub(crate) fn parse_interfaces_json(json: &str) -> Result<Vec<DiscoveredInterface>> {
    let doc: JsonInterfaces = serde_json::from_str(json)
        .map_err(|e| IpamError::Source(format!("malformed interfaces file: {e}")))?;
    Ok(doc
        .interfaces
        .into_iter()
        .map(|iface| DiscoveredInterface {
            mac: iface.mac_address,
            is_primary: iface.is_primary,
            subnets: iface
                .ip_subnets
                .into_iter()
                .map(|subnet| DiscoveredSubnet {
                    prefix: subnet.prefix,
                    addresses: subnet
                        .ip_addresses
                        .into_iter()
                        .map(|a| DiscoveredAddress {
                            address: a.address,
                            is_primary: a.is_primary,
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect())
}

/// Adds a pool per discovered subnet to `space`, owned by the host
/// interface with the matching MAC. Primary addresses stay with the host
/// and are not added. Interfaces that are not present on the host and
/// malformed entries are skipped.
pub(crate) fn populate(
    space: &mut AddressSpace,
    discovered: &[DiscoveredInterface],
    host: &[HostInterface],
) {
    for iface in discovered {
        let mac = normalize_mac(&iface.mac);
        let owner = if mac == ANY_MAC {
            host.first()
        } else {
            host.iter().find(|h| !h.mac.is_empty() && h.mac == mac)
        };
        let Some(owner) = owner else {
            debug!(mac = %mac, "no host interface for discovered MAC");
            continue;
        };
        let priority = if iface.is_primary {
            PRIORITY_PRIMARY
        } else {
            PRIORITY_SECONDARY
        };

        for subnet in &iface.subnets {
            let Ok(net) = subnet.prefix.parse::<IpNet>() else {
                warn!(prefix = %subnet.prefix, "skipping malformed subnet prefix");
                continue;
            };
            let pool = match space.new_pool(&owner.name, priority, net) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(subnet = %net, if_name = %owner.name, error = %e, "skipping subnet");
                    continue;
                }
            };
            for entry in subnet.addresses.iter().filter(|a| !a.is_primary) {
                let Ok(addr) = entry.address.parse::<IpAddr>() else {
                    warn!(address = %entry.address, "skipping malformed address");
                    continue;
                };
                if let Err(e) = pool.new_address_record(addr) {
                    warn!(address = %addr, subnet = %net, error = %e, "skipping address");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::AddressScope;

    const XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Interfaces>
  <Interface MacAddress="000D3A6E2EC4" IsPrimary="true">
    <IPSubnet Prefix="10.0.0.0/16">
      <IPAddress Address="10.0.0.4" IsPrimary="true"/>
      <IPAddress Address="10.0.0.5" IsPrimary="false"/>
      <IPAddress Address="10.0.0.6" IsPrimary="false"/>
    </IPSubnet>
  </Interface>
  <Interface MacAddress="000D3A6E2EC5" IsPrimary="false">
    <IPSubnet Prefix="10.1.0.0/16">
      <IPAddress Address="10.1.0.4" IsPrimary="true"/>
      <IPAddress Address="10.1.0.5" IsPrimary="false"/>
    </IPSubnet>
  </Interface>
</Interfaces>"#;

    fn host() -> Vec<HostInterface> {
        vec![
            HostInterface::new("eth0", "00:0d:3a:6e:2e:c4"),
            HostInterface::new("eth1", "00:0d:3a:6e:2e:c5"),
        ]
    }

    fn build(discovered: &[DiscoveredInterface], host: &[HostInterface]) -> AddressSpace {
        let mut space = AddressSpace::new("local", AddressScope::Local);
        populate(&mut space, discovered, host);
        space
    }

    #[test]
    fn test_parse_xml() {
        let discovered = parse_interfaces_xml(XML).expect("parse");
        assert_eq!(discovered.len(), 2);
        assert!(discovered[0].is_primary);
        assert_eq!(discovered[0].subnets[0].prefix, "10.0.0.0/16");
        assert_eq!(discovered[0].subnets[0].addresses.len(), 3);
        assert!(discovered[0].subnets[0].addresses[0].is_primary);
        assert!(!discovered[1].is_primary);
    }

    #[test]
    fn test_parse_xml_rejects_garbage() {
        assert!(matches!(
            parse_interfaces_xml("<Interfaces><Interface"),
            Err(IpamError::Source(_))
        ));
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"Interfaces":[{"MacAddress":"000D3A6E2EC4","IsPrimary":true,
            "IPSubnets":[{"Prefix":"10.0.0.0/16","IPAddresses":[
                {"Address":"10.0.0.4","IsPrimary":true},
                {"Address":"10.0.0.5","IsPrimary":false}]}]}]}"#;
        let discovered = parse_interfaces_json(json).expect("parse");
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].mac, "000D3A6E2EC4");
        assert_eq!(discovered[0].subnets[0].addresses[1].address, "10.0.0.5");
    }

    #[test]
    fn test_populate_matches_macs_and_skips_primary() {
        let space = build(&parse_interfaces_xml(XML).expect("parse"), &host());

        let eth0 = space.get_pool("10.0.0.0/16").expect("eth0 pool");
        assert_eq!(eth0.if_name(), "eth0");
        assert_eq!(eth0.priority(), PRIORITY_PRIMARY);
        assert_eq!(eth0.len(), 2);
        assert!(eth0.record("10.0.0.4".parse().expect("ip")).is_none());

        let eth1 = space.get_pool("10.1.0.0/16").expect("eth1 pool");
        assert_eq!(eth1.if_name(), "eth1");
        assert_eq!(eth1.priority(), PRIORITY_SECONDARY);
        assert_eq!(eth1.len(), 1);
    }

    #[test]
    fn test_populate_skips_unknown_interfaces() {
        let only_eth0 = vec![HostInterface::new("eth0", "00:0d:3a:6e:2e:c4")];
        let space = build(&parse_interfaces_xml(XML).expect("parse"), &only_eth0);
        assert_eq!(space.pools().count(), 1);
        assert!(space.get_pool("10.1.0.0/16").is_err());
    }

    #[test]
    fn test_wildcard_mac_matches_first_interface() {
        let discovered = vec![DiscoveredInterface {
            mac: "*".to_string(),
            is_primary: true,
            subnets: vec![DiscoveredSubnet {
                prefix: "192.168.0.0/24".to_string(),
                addresses: vec![DiscoveredAddress {
                    address: "192.168.0.10".to_string(),
                    is_primary: false,
                }],
            }],
        }];
        let space = build(&discovered, &host());
        let pool = space.get_pool("192.168.0.0/24").expect("pool");
        assert_eq!(pool.if_name(), "eth0");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_populate_skips_malformed_entries() {
        let discovered = vec![DiscoveredInterface {
            mac: "000D3A6E2EC4".to_string(),
            is_primary: true,
            subnets: vec![
                DiscoveredSubnet {
                    prefix: "garbage".to_string(),
                    addresses: vec![],
                },
                DiscoveredSubnet {
                    prefix: "10.0.0.0/24".to_string(),
                    addresses: vec![
                        DiscoveredAddress {
                            address: "10.9.9.9".to_string(),
                            is_primary: false,
                        },
                        DiscoveredAddress {
                            address: "nope".to_string(),
                            is_primary: false,
                        },
                        DiscoveredAddress {
                            address: "10.0.0.7".to_string(),
                            is_primary: false,
                        },
                    ],
                },
            ],
        }];
        let space = build(&discovered, &host());
        assert_eq!(space.pools().count(), 1);
        assert_eq!(space.get_pool("10.0.0.0/24").expect("pool").len(), 1);
    }
}
