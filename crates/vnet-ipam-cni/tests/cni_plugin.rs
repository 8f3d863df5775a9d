//! Runs CNI commands as separate invocations against one state file.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use vnet_ipam::{FakeInterfaces, IpamError};
use vnet_ipam_cni::{CniError, CniPlugin, NetworkConfig};
use vnet_ipam_store::JsonFileStore;

const INTERFACES: &str = r#"{
    "Interfaces": [{
        "MacAddress": "00-0D-3A-6E-2E-C4",
        "IsPrimary": true,
        "IPSubnets": [{
            "Prefix": "192.168.1.0/24",
            "IPAddresses": [
                {"Address": "192.168.1.4", "IsPrimary": true},
                {"Address": "192.168.1.5", "IsPrimary": false},
                {"Address": "192.168.1.6", "IsPrimary": false}
            ]
        }]
    }]
}"#;

struct Node {
    dir: tempfile::TempDir,
}

impl Node {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("interfaces.json"), INTERFACES).expect("write");
        Self { dir }
    }

    fn config(&self, ipam: Value) -> NetworkConfig {
        let mut ipam_section = json!({
            "type": "azure-vnet-ipam",
            "environment": "fileIpam",
            "interfacesFile": self.dir.path().join("interfaces.json"),
            "queryInterval": 0
        });
        if let (Some(section), Some(extra)) = (ipam_section.as_object_mut(), ipam.as_object()) {
            section.extend(extra.clone());
        }
        let config = json!({
            "cniVersion": "0.4.0",
            "name": "azure",
            "type": "azure-vnet",
            "master": "eth0",
            "ipam": ipam_section
        });
        NetworkConfig::parse(config.to_string().as_bytes()).expect("config")
    }

    /// Starts a fresh plugin process against the shared state file.
    async fn invoke(&self, ipam: Value) -> CniPlugin {
        let store = Arc::new(JsonFileStore::new(self.store_path()));
        CniPlugin::start(
            store,
            self.config(ipam),
            Some(Arc::new(
                FakeInterfaces::new().with_interface("eth0", "00:0d:3a:6e:2e:c4"),
            )),
        )
        .await
        .expect("start plugin")
    }

    fn store_path(&self) -> std::path::PathBuf {
        self.dir.path().join("azure-vnet-ipam.json")
    }
}

fn address_of(result: &vnet_ipam_cni::IpamResult) -> &str {
    &result.ips[0].address
}

#[tokio::test]
async fn test_add_and_del_across_invocations() {
    let node = Node::new();

    let plugin = node.invoke(json!({})).await;
    let first = plugin.add("container-1").await.expect("add");
    plugin.stop().await;

    assert_eq!(address_of(&first), "192.168.1.5/24");
    assert_eq!(first.ips[0].version.as_deref(), Some("4"));
    assert_eq!(first.ips[0].gateway.to_string(), "192.168.1.1");
    assert_eq!(first.routes[0].dst.to_string(), "0.0.0.0/0");
    assert_eq!(first.dns.nameservers[0].to_string(), "168.63.129.16");
    assert!(Path::new(&node.store_path()).exists());

    let plugin = node.invoke(json!({"subnet": "192.168.1.0/24"})).await;
    let second = plugin.add("container-2").await.expect("add");
    plugin.stop().await;
    assert_eq!(address_of(&second), "192.168.1.6/24");

    // The runtime hands the previous result back on DEL.
    let result = serde_json::to_value(&first).expect("encode");
    let plugin = node.invoke(json!({"result": result})).await;
    plugin.del("container-1").await.expect("del");
    plugin.stop().await;

    let plugin = node.invoke(json!({"subnet": "192.168.1.0/24"})).await;
    let third = plugin.add("container-3").await.expect("add");
    plugin.stop().await;
    assert_eq!(address_of(&third), "192.168.1.5/24");
}

#[tokio::test]
async fn test_repeated_add_returns_same_address() {
    let node = Node::new();

    let plugin = node.invoke(json!({"subnet": "192.168.1.0/24"})).await;
    let first = plugin.add("container-1").await.expect("add");
    plugin.stop().await;

    let plugin = node.invoke(json!({"subnet": "192.168.1.0/24"})).await;
    let again = plugin.add("container-1").await.expect("add");
    plugin.stop().await;

    assert_eq!(address_of(&first), address_of(&again));
}

#[tokio::test]
async fn test_exhausted_pool_reports_ipam_error() {
    let node = Node::new();
    let pool = json!({"subnet": "192.168.1.0/24"});

    for id in ["container-1", "container-2"] {
        let plugin = node.invoke(pool.clone()).await;
        plugin.add(id).await.expect("add");
        plugin.stop().await;
    }

    let plugin = node.invoke(pool).await;
    let err = plugin.add("container-3").await.expect_err("exhausted");
    plugin.stop().await;

    assert!(matches!(err, CniError::Ipam(IpamError::NoAvailableAddresses)));
    let output = err.to_output("0.4.0");
    assert_eq!(output.code, 100);
    assert_eq!(output.details, "No available addresses");
}

#[tokio::test]
async fn test_failed_add_returns_reserved_pool() {
    let node = Node::new();

    let plugin = node.invoke(json!({"ipAddress": "192.168.1.99"})).await;
    assert!(plugin.add("container-1").await.is_err());
    plugin.stop().await;

    // Had the pool stayed reserved, selecting any pool would fail.
    let plugin = node.invoke(json!({})).await;
    let result = plugin.add("container-2").await.expect("add");
    plugin.stop().await;
    assert_eq!(address_of(&result), "192.168.1.5/24");
}

#[tokio::test]
async fn test_del_without_address_releases_pool() {
    let node = Node::new();

    let plugin = node.invoke(json!({})).await;
    plugin.add("container-1").await.expect("add");
    plugin.stop().await;

    let plugin = node.invoke(json!({"subnet": "192.168.1.0/24"})).await;
    plugin.del("").await.expect("release pool");
    plugin.stop().await;

    let plugin = node.invoke(json!({})).await;
    plugin.add("container-2").await.expect("pool free again");
    plugin.stop().await;
}

#[tokio::test]
async fn test_del_with_nothing_known_is_ok() {
    let node = Node::new();
    let plugin = node.invoke(json!({})).await;
    plugin.del("container-1").await.expect("no-op");
    plugin.stop().await;
}

#[tokio::test]
async fn test_unknown_environment_is_config_error() {
    let node = Node::new();
    let store = Arc::new(JsonFileStore::new(node.store_path()));
    let err = CniPlugin::start(store, node.config(json!({"environment": "openstack"})), None)
        .await
        .expect_err("invalid");
    assert_eq!(err.code(), 7);
}
