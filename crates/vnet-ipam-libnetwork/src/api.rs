//! Request and response payloads of the libnetwork remote IPAM protocol.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use vnet_ipam::Options;

/// Plugin subsystem implemented by this driver.
pub const IPAM_DRIVER: &str = "IpamDriver";

/// Option Docker sets when it asks for a network's gateway address.
pub const DOCKER_ADDRESS_TYPE: &str = "RequestAddressType";

/// [`DOCKER_ADDRESS_TYPE`] value for gateway requests.
pub const DOCKER_GATEWAY: &str = "com.docker.network.gateway";

/// Treats JSON `null` like an absent field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `/Plugin.Activate` response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    /// Subsystems implemented.
    pub implements: Vec<String>,
}

/// `/IpamDriver.GetCapabilities` response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    /// Docker must pass the endpoint MAC with address requests.
    #[serde(rename = "RequiresMACAddress")]
    pub requires_mac_address: bool,
    /// Docker must replay pool and address requests after it restarts.
    pub requires_request_replay: bool,
}

/// `/IpamDriver.GetDefaultAddressSpaces` response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DefaultAddressSpacesResponse {
    /// Space for node-local networks.
    pub local_default_address_space: String,
    /// Space for cluster-wide networks.
    pub global_default_address_space: String,
}

/// `/IpamDriver.RequestPool` request.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestPoolRequest {
    /// Address space to reserve from.
    #[serde(deserialize_with = "nullable")]
    pub address_space: String,
    /// Requested subnet; empty for any.
    #[serde(deserialize_with = "nullable")]
    pub pool: String,
    /// Requested child range.
    #[serde(deserialize_with = "nullable")]
    pub sub_pool: String,
    /// Driver options.
    #[serde(deserialize_with = "nullable")]
    pub options: Options,
    /// Whether an IPv6 pool is wanted.
    #[serde(rename = "V6")]
    pub v6: bool,
}

/// `/IpamDriver.RequestPool` response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RequestPoolResponse {
    /// Opaque pool handle for later calls.
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    /// Pool subnet in CIDR form.
    pub pool: String,
    /// Extra pool attributes.
    pub data: HashMap<String, String>,
}

/// `/IpamDriver.ReleasePool` request.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReleasePoolRequest {
    /// Pool handle from [`RequestPoolResponse`].
    #[serde(rename = "PoolID", deserialize_with = "nullable")]
    pub pool_id: String,
}

/// `/IpamDriver.GetPoolInfo` request.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GetPoolInfoRequest {
    /// Pool handle from [`RequestPoolResponse`].
    #[serde(rename = "PoolID", deserialize_with = "nullable")]
    pub pool_id: String,
}

/// `/IpamDriver.GetPoolInfo` response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct GetPoolInfoResponse {
    /// Number of addresses in the pool.
    pub capacity: usize,
    /// Number of free addresses.
    pub available: usize,
    /// Leased addresses that discovery no longer reports.
    pub unhealthy_addresses: Vec<String>,
}

/// `/IpamDriver.RequestAddress` request.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestAddressRequest {
    /// Pool handle from [`RequestPoolResponse`].
    #[serde(rename = "PoolID", deserialize_with = "nullable")]
    pub pool_id: String,
    /// Requested address; empty for any.
    #[serde(deserialize_with = "nullable")]
    pub address: String,
    /// Driver options.
    #[serde(deserialize_with = "nullable")]
    pub options: Options,
}

/// `/IpamDriver.RequestAddress` response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RequestAddressResponse {
    /// Leased address in CIDR form.
    pub address: String,
    /// Extra address attributes.
    pub data: HashMap<String, String>,
}

/// `/IpamDriver.ReleaseAddress` request.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReleaseAddressRequest {
    /// Pool handle from [`RequestPoolResponse`].
    #[serde(rename = "PoolID", deserialize_with = "nullable")]
    pub pool_id: String,
    /// Address to release.
    #[serde(deserialize_with = "nullable")]
    pub address: String,
    /// Driver options.
    #[serde(deserialize_with = "nullable")]
    pub options: Options,
}

/// Body of calls that return nothing.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmptyResponse {}

/// Body of a failed call.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Error message.
    #[serde(rename = "Err")]
    pub err: String,
}
