//! IP address management for Azure virtual network container plugins.
//!
//! Addresses are organized as a forest: an [`AddressSpace`] holds
//! [`AddressPool`]s keyed by subnet, and each pool holds
//! [`AddressRecord`]s keyed by IP. An [`AddressSource`] periodically
//! rediscovers what the host owns and the space merges each snapshot
//! generationally, so leased addresses survive while vanished free ones are
//! collected. [`AddressManager`] serializes every operation behind one lock
//! and persists the forest to a [`vnet_ipam_store::KeyValueStore`].

#![forbid(unsafe_code)]

pub mod error;
pub mod manager;
pub mod options;
pub mod platform;
pub mod pool;
pub mod pool_id;
pub mod record;
pub mod source;
pub mod space;

pub use error::{IpamError, Result};
pub use manager::{AddressManager, ManagerOptions, NetworkPluginHook, STORE_KEY};
pub use options::{
    OPT_ADDRESS_ID, OPT_ADDRESS_TYPE, OPT_ADDRESS_TYPE_GATEWAY, OPT_INTERFACE_NAME, Options,
};
pub use platform::{FakeInterfaces, HostInterface, InterfaceLister, SystemInterfaces};
pub use pool::{AddressPool, DNS_PROXY, PoolInfo};
pub use pool_id::PoolId;
pub use record::AddressRecord;
pub use source::{AddressConfigSink, AddressSource, Environment, SourceConfig};
pub use space::{
    AddressScope, AddressSpace, GLOBAL_DEFAULT_ADDRESS_SPACE, LOCAL_DEFAULT_ADDRESS_SPACE,
    MergeSummary,
};
