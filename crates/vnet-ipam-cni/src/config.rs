//! Network configuration read from stdin.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use vnet_ipam::{Environment, IpamError, LOCAL_DEFAULT_ADDRESS_SPACE, SourceConfig};

use crate::error::{CniError, Result};

/// Result format used when the configuration does not name one.
pub const DEFAULT_CNI_VERSION: &str = "0.4.0";

/// The network configuration passed by the container runtime.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Version of the result format to produce.
    #[serde(rename = "cniVersion", alias = "cniversion")]
    pub cni_version: String,
    /// Network name.
    pub name: String,
    /// Main plugin type.
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Host interface the network is attached to.
    pub master: String,
    /// IPAM section.
    pub ipam: IpamConfig,
    /// Result of a previous ADD passed back by the runtime.
    #[serde(rename = "prevResult")]
    pub prev_result: Option<Value>,
}

/// The `ipam` section of the network configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct IpamConfig {
    /// IPAM plugin type.
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Address source environment; defaults to `azure`.
    pub environment: String,
    /// Address space; defaults to the local space.
    pub address_space: String,
    /// Pool subnet; empty selects any pool.
    pub subnet: String,
    /// Requested address; empty selects any.
    pub ip_address: String,
    /// Seconds between address source queries.
    pub query_interval: Option<Value>,
    /// Address source endpoint override.
    pub query_url: String,
    /// Interface description file for the `mas` and `fileIpam` sources.
    pub interfaces_file: String,
    /// Result of a previous ADD, used by DEL to find the lease.
    pub result: Option<Value>,
}

impl NetworkConfig {
    /// Parses the configuration from `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Result format version to emit.
    pub fn cni_version(&self) -> &str {
        if self.cni_version.is_empty() {
            DEFAULT_CNI_VERSION
        } else {
            &self.cni_version
        }
    }

    /// Address space to operate in.
    pub fn address_space(&self) -> &str {
        if self.ipam.address_space.is_empty() {
            LOCAL_DEFAULT_ADDRESS_SPACE
        } else {
            &self.ipam.address_space
        }
    }

    /// Address source environment.
    pub fn environment(&self) -> Result<Environment> {
        if self.ipam.environment.is_empty() {
            return Ok(Environment::Azure);
        }
        Ok(self.ipam.environment.parse::<Environment>()?)
    }

    /// Builds the address source settings.
    pub fn source_config(&self) -> Result<SourceConfig> {
        let query_interval = match &self.ipam.query_interval {
            None => None,
            Some(Value::Number(n)) => Some(n.as_u64().ok_or_else(|| {
                CniError::InvalidConfig(format!("invalid queryInterval {n}"))
            })?),
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(
                s.parse()
                    .map_err(|_| CniError::InvalidConfig(format!("invalid queryInterval {s:?}")))?,
            ),
            Some(other) => {
                return Err(CniError::InvalidConfig(format!(
                    "invalid queryInterval {other}"
                )));
            }
        };
        let config = SourceConfig {
            environment: self.environment()?,
            query_url: (!self.ipam.query_url.is_empty()).then(|| self.ipam.query_url.clone()),
            query_interval,
            file_path: (!self.ipam.interfaces_file.is_empty())
                .then(|| PathBuf::from(&self.ipam.interfaces_file)),
            ..SourceConfig::default()
        };
        config.validate().map_err(|e| match e {
            IpamError::InvalidConfiguration(msg) => CniError::InvalidConfig(msg),
            other => CniError::Ipam(other),
        })?;
        Ok(config)
    }

    /// Whether pools should be selected from the IPv6 family.
    pub fn wants_ipv6(&self) -> bool {
        matches!(self.environment(), Ok(Environment::Ipv6NodeIpam))
    }

    /// First address recorded in the previous result, in CIDR form.
    /// `prevResult` wins over the IPAM section's `result`.
    pub fn previous_address(&self) -> Option<String> {
        [&self.prev_result, &self.ipam.result]
            .into_iter()
            .flatten()
            .find_map(first_address)
    }
}

fn first_address(result: &Value) -> Option<String> {
    result
        .get("ips")?
        .as_array()?
        .iter()
        .find_map(|ip| ip.get("address")?.as_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_case::test_case;

    const CONFIG: &str = r#"{
        "cniVersion": "0.4.0",
        "name": "azure",
        "type": "azure-vnet",
        "master": "eth0",
        "ipam": {
            "type": "azure-vnet-ipam",
            "environment": "fileIpam",
            "subnet": "10.0.0.0/16",
            "queryInterval": "30",
            "interfacesFile": "/etc/azure/interfaces.json"
        }
    }"#;

    #[test]
    fn test_parse() {
        let config = NetworkConfig::parse(CONFIG.as_bytes()).expect("parse");
        assert_eq!(config.cni_version(), "0.4.0");
        assert_eq!(config.master, "eth0");
        assert_eq!(config.ipam.plugin_type, "azure-vnet-ipam");
        assert_eq!(config.ipam.subnet, "10.0.0.0/16");
        assert_eq!(config.address_space(), "local");

        let source = config.source_config().expect("source");
        assert_eq!(source.environment, Environment::FileIpam);
        assert_eq!(source.query_interval(), Duration::from_secs(30));
        assert_eq!(
            source.file_path,
            Some(PathBuf::from("/etc/azure/interfaces.json"))
        );
    }

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::parse(br#"{"ipam": {}}"#).expect("parse");
        assert_eq!(config.cni_version(), DEFAULT_CNI_VERSION);
        assert_eq!(config.environment().expect("env"), Environment::Azure);
        assert!(!config.wants_ipv6());
        assert!(config.previous_address().is_none());
    }

    #[test]
    fn test_lowercase_version_key() {
        let config = NetworkConfig::parse(br#"{"cniversion": "0.3.1"}"#).expect("parse");
        assert_eq!(config.cni_version(), "0.3.1");
    }

    #[test_case(r#"{"ipam": {"environment": "openstack"}}"# ; "unknown environment")]
    #[test_case(r#"{"ipam": {"queryInterval": "soon"}}"# ; "bad interval string")]
    #[test_case(r#"{"ipam": {"queryInterval": -5}}"# ; "negative interval")]
    #[test_case(r#"{"ipam": {"queryUrl": "not a url"}}"# ; "bad url")]
    fn test_invalid(json: &str) {
        let config = NetworkConfig::parse(json.as_bytes()).expect("parse");
        assert!(matches!(
            config.source_config(),
            Err(CniError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_numeric_interval() {
        let config = NetworkConfig::parse(br#"{"ipam": {"queryInterval": 15}}"#).expect("parse");
        let source = config.source_config().expect("source");
        assert_eq!(source.query_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_previous_address() {
        let config = NetworkConfig::parse(
            br#"{"ipam": {"result": {"ips": [{"address": "10.0.0.5/16", "gateway": "10.0.0.1"}]}}}"#,
        )
        .expect("parse");
        assert_eq!(config.previous_address().as_deref(), Some("10.0.0.5/16"));
    }

    #[test]
    fn test_prev_result_wins() {
        let config = NetworkConfig::parse(
            br#"{
                "prevResult": {"ips": [{"address": "10.0.0.7/16"}]},
                "ipam": {"result": {"ips": [{"address": "10.0.0.5/16"}]}}
            }"#,
        )
        .expect("parse");
        assert_eq!(config.previous_address().as_deref(), Some("10.0.0.7/16"));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            NetworkConfig::parse(b"{\"ipam\": "),
            Err(CniError::Decode(_))
        ));
    }
}
