//! Kubernetes node source: carves an IPv6 pool out of the node's pod CIDR.

use std::future::Future;
use std::net::{IpAddr, Ipv6Addr};
use std::ops::RangeInclusive;

use ipnet::{IpNet, Ipv6Net};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tracing::{debug, info};

use crate::error::{IpamError, Result};
use crate::pool::PRIORITY_PRIMARY;
use crate::space::{AddressScope, LOCAL_DEFAULT_ADDRESS_SPACE};

use super::AddressConfigSink;

/// Oldest API server that reports `podCIDRs`.
pub const MIN_KUBERNETES_VERSION: (u32, u32) = (1, 16);

/// Prefix lengths accepted for the node pool.
pub const IPV6_MASK_LEN_RANGE: RangeInclusive<u8> = 112..=127;

/// The slice of the Kubernetes API this source needs.
pub trait NodeClient: Send + Sync {
    /// Returns the API server's `(major, minor)` version.
    fn server_version(&self) -> impl Future<Output = Result<(u32, u32)>> + Send;

    /// Returns the pod CIDRs assigned to `node`.
    fn node_pod_cidrs(&self, node: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// [`NodeClient`] backed by a `kube` client.
#[derive(Clone)]
pub struct KubeNodeClient {
    client: Client,
}

impl std::fmt::Debug for KubeNodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeNodeClient").finish_non_exhaustive()
    }
}

impl KubeNodeClient {
    /// Wraps an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects using the in-cluster service account, falling back to the
    /// local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

impl NodeClient for KubeNodeClient {
    async fn server_version(&self) -> Result<(u32, u32)> {
        let info = self.client.apiserver_version().await?;
        parse_version(&info.major, &info.minor)
    }

    async fn node_pod_cidrs(&self, node: &str) -> Result<Vec<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let spec = nodes.get(node).await?.spec.unwrap_or_default();
        match spec.pod_cidrs {
            Some(cidrs) if !cidrs.is_empty() => Ok(cidrs),
            _ => Ok(spec.pod_cidr.into_iter().collect()),
        }
    }
}

/// Parses version components such as `"1"` and `"18+"`.
fn parse_version(major: &str, minor: &str) -> Result<(u32, u32)> {
    let number = |s: &str| {
        let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
        digits
            .parse::<u32>()
            .map_err(|_| IpamError::Source(format!("unrecognized Kubernetes version {major}.{minor}")))
    };
    Ok((number(major)?, number(minor)?))
}

/// Publishes one IPv6 pool on a host interface, built from the node's pod
/// CIDR narrowed to a fixed prefix length.
#[derive(Debug)]
pub struct Ipv6NodeSource<C = KubeNodeClient> {
    client: C,
    node_name: String,
    interface_name: String,
    mask_len: u8,
    loaded: bool,
}

impl<C: NodeClient> Ipv6NodeSource<C> {
    /// Creates a source for `node_name`.
    pub fn new(client: C, node_name: String, interface_name: &str, mask_len: u8) -> Self {
        Self {
            client,
            node_name,
            interface_name: interface_name.to_string(),
            mask_len,
            loaded: false,
        }
    }

    pub(crate) async fn start(&mut self) -> Result<()> {
        let version = self.client.server_version().await?;
        if version < MIN_KUBERNETES_VERSION {
            return Err(IpamError::Source(format!(
                "Kubernetes {}.{} is older than the required {}.{}",
                version.0, version.1, MIN_KUBERNETES_VERSION.0, MIN_KUBERNETES_VERSION.1
            )));
        }
        info!(node = %self.node_name, major = version.0, minor = version.1, "IPv6 node source started");
        Ok(())
    }

    pub(crate) async fn refresh<K: AddressConfigSink + Send>(&mut self, sink: &mut K) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let cidrs = self.client.node_pod_cidrs(&self.node_name).await?;
        let pod_cidr = cidrs
            .iter()
            .find_map(|cidr| cidr.parse::<Ipv6Net>().ok())
            .ok_or_else(|| {
                IpamError::Source(format!("node {} has no IPv6 pod CIDR", self.node_name))
            })?;
        let subnet = node_subnet(pod_cidr, self.mask_len)?;
        debug!(pod_cidr = %pod_cidr, subnet = %subnet, "carving IPv6 node pool");

        let mut local = sink.new_address_space(LOCAL_DEFAULT_ADDRESS_SPACE, AddressScope::Local)?;
        let pool = local.new_pool(&self.interface_name, PRIORITY_PRIMARY, IpNet::V6(subnet))?;
        for addr in host_addresses(subnet) {
            pool.new_address_record(IpAddr::V6(addr))?;
        }
        sink.set_address_space(local)?;

        self.loaded = true;
        Ok(())
    }
}

/// Narrows `pod_cidr` to `/mask_len`, keeping its network address.
fn node_subnet(pod_cidr: Ipv6Net, mask_len: u8) -> Result<Ipv6Net> {
    if !IPV6_MASK_LEN_RANGE.contains(&mask_len) {
        return Err(IpamError::InvalidConfiguration(format!(
            "IPv6 pool prefix length {mask_len} must be between {} and {}",
            IPV6_MASK_LEN_RANGE.start(),
            IPV6_MASK_LEN_RANGE.end()
        )));
    }
    if mask_len < pod_cidr.prefix_len() {
        return Err(IpamError::InvalidConfiguration(format!(
            "pool prefix length {mask_len} is shorter than pod CIDR {pod_cidr}"
        )));
    }
    Ipv6Net::new(pod_cidr.network(), mask_len)
        .map(|net| net.trunc())
        .map_err(|e| IpamError::InvalidConfiguration(e.to_string()))
}

/// Every address in `subnet` except the network address and the gateway.
fn host_addresses(subnet: Ipv6Net) -> impl Iterator<Item = Ipv6Addr> {
    let base = u128::from(subnet.network());
    let size = 1u128 << (128 - u32::from(subnet.prefix_len()));
    (2..size).map(move |offset| Ipv6Addr::from(base + offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::test_support::RecordingSink;
    use test_case::test_case;

    #[derive(Debug)]
    struct FakeNodeClient {
        version: (u32, u32),
        cidrs: Vec<String>,
    }

    impl FakeNodeClient {
        fn new(cidrs: &[&str]) -> Self {
            Self {
                version: (1, 18),
                cidrs: cidrs.iter().map(ToString::to_string).collect(),
            }
        }
    }

    impl NodeClient for FakeNodeClient {
        async fn server_version(&self) -> Result<(u32, u32)> {
            Ok(self.version)
        }

        async fn node_pod_cidrs(&self, _node: &str) -> Result<Vec<String>> {
            Ok(self.cidrs.clone())
        }
    }

    #[test_case("1", "16", (1, 16) ; "plain")]
    #[test_case("1", "18+", (1, 18) ; "managed suffix")]
    fn test_parse_version(major: &str, minor: &str, expected: (u32, u32)) {
        assert_eq!(parse_version(major, minor).expect("version"), expected);
    }

    #[test]
    fn test_parse_version_garbage() {
        assert!(parse_version("v", "x").is_err());
    }

    #[tokio::test]
    async fn test_rejects_old_api_server() {
        let mut client = FakeNodeClient::new(&[]);
        client.version = (1, 15);
        let mut source = Ipv6NodeSource::new(client, "node-0".into(), "eth0", 120);
        assert!(matches!(source.start().await, Err(IpamError::Source(_))));
    }

    #[tokio::test]
    async fn test_builds_pool_from_ipv6_cidr() {
        let client = FakeNodeClient::new(&["10.244.1.0/24", "fd00:10:244:1::/64"]);
        let mut source = Ipv6NodeSource::new(client, "node-0".into(), "eth0", 120);
        source.start().await.expect("start");

        let mut sink = RecordingSink::default();
        source.refresh(&mut sink).await.expect("refresh");
        source.refresh(&mut sink).await.expect("refresh again");
        assert_eq!(sink.received.len(), 1);

        let pool = sink.received[0].get_pool("fd00:10:244:1::/120").expect("pool");
        assert!(pool.is_ipv6());
        assert_eq!(pool.if_name(), "eth0");
        assert_eq!(pool.len(), 254);
        assert_eq!(pool.gateway(), "fd00:10:244:1::1".parse::<IpAddr>().expect("ip"));
        assert!(pool.record("fd00:10:244:1::".parse().expect("ip")).is_none());
        assert!(pool.record("fd00:10:244:1::1".parse().expect("ip")).is_none());
        assert!(pool.record("fd00:10:244:1::ff".parse().expect("ip")).is_some());
    }

    #[tokio::test]
    async fn test_node_without_ipv6_cidr() {
        let client = FakeNodeClient::new(&["10.244.1.0/24"]);
        let mut source = Ipv6NodeSource::new(client, "node-0".into(), "eth0", 120);
        let mut sink = RecordingSink::default();
        assert!(matches!(
            source.refresh(&mut sink).await,
            Err(IpamError::Source(_))
        ));
        assert!(sink.received.is_empty());
    }

    #[test]
    fn test_node_subnet_rejects_wider_mask() {
        let cidr: Ipv6Net = "fd00::/120".parse().expect("cidr");
        assert!(node_subnet(cidr, 112).is_err());
    }

    #[test_case("::/0", 0 ; "whole address space")]
    #[test_case("fd00:10:244:1::/64", 64 ; "full pod cidr")]
    #[test_case("fd00:10:244:1::/64", 128 ; "single address")]
    fn test_node_subnet_rejects_mask_out_of_range(cidr: &str, mask_len: u8) {
        let cidr: Ipv6Net = cidr.parse().expect("cidr");
        assert!(matches!(
            node_subnet(cidr, mask_len),
            Err(IpamError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_rejects_unbounded_pool() {
        let client = FakeNodeClient::new(&["::/0"]);
        let mut source = Ipv6NodeSource::new(client, "node-0".into(), "eth0", 0);
        let mut sink = RecordingSink::default();
        assert!(matches!(
            source.refresh(&mut sink).await,
            Err(IpamError::InvalidConfiguration(_))
        ));
        assert!(sink.received.is_empty());
    }

    #[test]
    fn test_host_addresses_small_subnet() {
        let subnet: Ipv6Net = "fd00::/126".parse().expect("cidr");
        let addrs: Vec<Ipv6Addr> = host_addresses(subnet).collect();
        assert_eq!(
            addrs,
            vec![
                "fd00::2".parse::<Ipv6Addr>().expect("ip"),
                "fd00::3".parse::<Ipv6Addr>().expect("ip"),
            ]
        );
    }
}
