//! The IPAM driver: translates plugin calls into address manager operations.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;
use vnet_ipam::{
    AddressManager, IpamError, OPT_ADDRESS_TYPE, OPT_ADDRESS_TYPE_GATEWAY, Options, PoolId,
};

use crate::api::{
    ActivateResponse, CapabilitiesResponse, DOCKER_ADDRESS_TYPE, DOCKER_GATEWAY,
    DefaultAddressSpacesResponse, EmptyResponse, GetPoolInfoRequest, GetPoolInfoResponse,
    IPAM_DRIVER, ReleaseAddressRequest, ReleasePoolRequest, RequestAddressRequest,
    RequestAddressResponse, RequestPoolRequest, RequestPoolResponse,
};
use crate::listener::{PluginHandler, Reply};

/// Plugin activation path.
pub const ACTIVATE_PATH: &str = "/Plugin.Activate";

/// Method paths of the IPAM driver API.
pub mod paths {
    /// Capabilities query.
    pub const GET_CAPABILITIES: &str = "/IpamDriver.GetCapabilities";
    /// Default address spaces query.
    pub const GET_DEFAULT_ADDRESS_SPACES: &str = "/IpamDriver.GetDefaultAddressSpaces";
    /// Pool reservation.
    pub const REQUEST_POOL: &str = "/IpamDriver.RequestPool";
    /// Pool release.
    pub const RELEASE_POOL: &str = "/IpamDriver.ReleasePool";
    /// Pool description.
    pub const GET_POOL_INFO: &str = "/IpamDriver.GetPoolInfo";
    /// Address lease.
    pub const REQUEST_ADDRESS: &str = "/IpamDriver.RequestAddress";
    /// Address release.
    pub const RELEASE_ADDRESS: &str = "/IpamDriver.ReleaseAddress";
}

/// Serves the libnetwork IPAM API from an [`AddressManager`].
#[derive(Debug)]
pub struct IpamDriver {
    manager: Arc<AddressManager>,
}

impl IpamDriver {
    /// Creates a driver over `manager`.
    pub fn new(manager: Arc<AddressManager>) -> Self {
        Self { manager }
    }

    async fn request_pool(&self, req: RequestPoolRequest) -> vnet_ipam::Result<RequestPoolResponse> {
        let (pool, subnet) = self
            .manager
            .request_pool(&req.address_space, &req.pool, &req.sub_pool, &req.options, req.v6)
            .await?;
        Ok(RequestPoolResponse {
            pool_id: PoolId::new(req.address_space, pool, "").to_string(),
            pool: subnet,
            data: HashMap::new(),
        })
    }

    async fn release_pool(&self, req: ReleasePoolRequest) -> vnet_ipam::Result<EmptyResponse> {
        let id: PoolId = req.pool_id.parse()?;
        self.manager.release_pool(&id.as_id, &id.subnet).await?;
        Ok(EmptyResponse {})
    }

    async fn get_pool_info(&self, req: GetPoolInfoRequest) -> vnet_ipam::Result<GetPoolInfoResponse> {
        let id: PoolId = req.pool_id.parse()?;
        let info = self.manager.get_pool_info(&id.as_id, &id.subnet).await?;
        Ok(GetPoolInfoResponse {
            capacity: info.capacity,
            available: info.available,
            unhealthy_addresses: info
                .unhealthy_addresses
                .iter()
                .map(ToString::to_string)
                .collect(),
        })
    }

    async fn request_address(
        &self,
        req: RequestAddressRequest,
    ) -> vnet_ipam::Result<RequestAddressResponse> {
        let id: PoolId = req.pool_id.parse()?;
        let options = translate_options(req.options);
        let address = self
            .manager
            .request_address(&id.as_id, &id.subnet, &req.address, &options)
            .await?;
        Ok(RequestAddressResponse {
            address,
            data: HashMap::new(),
        })
    }

    async fn release_address(&self, req: ReleaseAddressRequest) -> vnet_ipam::Result<EmptyResponse> {
        let id: PoolId = req.pool_id.parse()?;
        let options = translate_options(req.options);
        self.manager
            .release_address(&id.as_id, &id.subnet, &req.address, &options)
            .await?;
        Ok(EmptyResponse {})
    }
}

/// Maps Docker's gateway request onto the manager's address type option.
fn translate_options(mut options: Options) -> Options {
    if options.get(DOCKER_ADDRESS_TYPE).map(String::as_str) == Some(DOCKER_GATEWAY) {
        options.insert(
            OPT_ADDRESS_TYPE.to_string(),
            OPT_ADDRESS_TYPE_GATEWAY.to_string(),
        );
    }
    options
}

fn decode<T: DeserializeOwned>(method: &str, body: &[u8]) -> Result<T, Reply> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(method, error = %e, "failed to decode request");
        Reply::BadRequest(e.to_string())
    })
}

fn respond<T: Serialize>(method: &str, result: Result<T, IpamError>) -> Reply {
    match result {
        Ok(value) => Reply::json(&value),
        Err(e) => {
            warn!(method, error = %e, "plugin call failed");
            Reply::Failure(e.to_string())
        }
    }
}

impl PluginHandler for IpamDriver {
    async fn handle(&self, method: &str, body: Bytes) -> Reply {
        match method {
            ACTIVATE_PATH => Reply::json(&ActivateResponse {
                implements: vec![IPAM_DRIVER.to_string()],
            }),
            paths::GET_CAPABILITIES => Reply::json(&CapabilitiesResponse {
                requires_mac_address: true,
                requires_request_replay: true,
            }),
            paths::GET_DEFAULT_ADDRESS_SPACES => {
                let (local, global) = self.manager.get_default_address_spaces().await;
                Reply::json(&DefaultAddressSpacesResponse {
                    local_default_address_space: local,
                    global_default_address_space: global,
                })
            }
            paths::REQUEST_POOL => match decode(method, &body) {
                Ok(req) => respond(method, self.request_pool(req).await),
                Err(reply) => reply,
            },
            paths::RELEASE_POOL => match decode(method, &body) {
                Ok(req) => respond(method, self.release_pool(req).await),
                Err(reply) => reply,
            },
            paths::GET_POOL_INFO => match decode(method, &body) {
                Ok(req) => respond(method, self.get_pool_info(req).await),
                Err(reply) => reply,
            },
            paths::REQUEST_ADDRESS => match decode(method, &body) {
                Ok(req) => respond(method, self.request_address(req).await),
                Err(reply) => reply,
            },
            paths::RELEASE_ADDRESS => match decode(method, &body) {
                Ok(req) => respond(method, self.release_address(req).await),
                Err(reply) => reply,
            },
            _ => {
                warn!(method, "unknown plugin method");
                Reply::NotFound
            }
        }
    }
}
