//! The address manager: owns all address spaces, drives the address source,
//! and persists state after every change.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use vnet_ipam_store::KeyValueStore;

use crate::error::{IpamError, Result};
use crate::options::Options;
use crate::platform::{self, InterfaceLister, SystemInterfaces};
use crate::pool::PoolInfo;
use crate::source::{AddressConfigSink, AddressSource, SourceConfig};
use crate::space::{
    AddressScope, AddressSpace, GLOBAL_DEFAULT_ADDRESS_SPACE, LOCAL_DEFAULT_ADDRESS_SPACE,
};

/// Store key holding the persisted state.
pub const STORE_KEY: &str = "IPAM";

/// Receives the local pools discovered by the address source, so a network
/// plugin can attach their interfaces.
pub trait NetworkPluginHook: Send + Sync {
    /// Registers `if_name` as an external interface carrying `subnet`.
    fn add_external_interface(
        &self,
        if_name: &str,
        subnet: &IpNet,
    ) -> std::result::Result<(), Box<dyn StdError + Send + Sync>>;
}

/// Options for [`AddressManager::initialize`].
#[derive(Clone, Default)]
pub struct ManagerOptions {
    /// Clear every lease on restore even when no reboot is detected. Used
    /// by callers that replay their leases after a restart.
    pub rehydrate_on_reboot: bool,
    /// Notified of local pools after each merge.
    pub network_plugin: Option<Arc<dyn NetworkPluginHook>>,
    /// Interface enumeration for address sources; defaults to the host's.
    pub interfaces: Option<Arc<dyn InterfaceLister>>,
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("rehydrate_on_reboot", &self.rehydrate_on_reboot)
            .field("network_plugin", &self.network_plugin.is_some())
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

#[derive(Serialize)]
struct PersistedStateRef<'a> {
    #[serde(rename = "Version")]
    version: &'a str,
    #[serde(rename = "TimeStamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "AddressSpaces")]
    address_spaces: &'a BTreeMap<String, AddressSpace>,
}

#[derive(Deserialize)]
struct PersistedState {
    #[serde(rename = "Version", default)]
    version: String,
    #[serde(rename = "TimeStamp", default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "AddressSpaces", default)]
    address_spaces: BTreeMap<String, AddressSpace>,
}

/// The address spaces plus everything needed to persist them. This is the
/// sink the address source writes into.
struct AddressBook {
    spaces: BTreeMap<String, AddressSpace>,
    store: Arc<dyn KeyValueStore>,
    network_plugin: Option<Arc<dyn NetworkPluginHook>>,
    last_saved: Option<DateTime<Utc>>,
}

impl AddressBook {
    fn new(
        store: Arc<dyn KeyValueStore>,
        network_plugin: Option<Arc<dyn NetworkPluginHook>>,
    ) -> Self {
        Self {
            spaces: BTreeMap::new(),
            store,
            network_plugin,
            last_saved: None,
        }
    }

    fn restore(&mut self, rehydrate_on_reboot: bool) -> Result<()> {
        let persisted: Option<PersistedState> = self.store.read_typed(STORE_KEY)?;
        if let Some(state) = persisted {
            let rebooted = self.rebooted_since_save();
            let reset = rebooted || rehydrate_on_reboot;
            self.spaces = state.address_spaces;
            for space in self.spaces.values_mut() {
                if reset {
                    space.reset_leases();
                }
                space.rebuild_indexes();
            }
            self.last_saved = state.timestamp;
            info!(
                version = %state.version,
                spaces = self.spaces.len(),
                rebooted,
                leases_reset = reset,
                "restored address state"
            );
        }

        for (id, scope) in [
            (LOCAL_DEFAULT_ADDRESS_SPACE, AddressScope::Local),
            (GLOBAL_DEFAULT_ADDRESS_SPACE, AddressScope::Global),
        ] {
            self.spaces
                .entry(id.to_string())
                .or_insert_with(|| AddressSpace::new(id, scope));
        }
        Ok(())
    }

    /// Whether the host booted after the store was last written.
    fn rebooted_since_save(&self) -> bool {
        let modified = match self.store.modification_time() {
            Ok(Some(modified)) => modified,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "failed to read store modification time");
                return false;
            }
        };
        match platform::last_reboot_time() {
            Ok(booted) => {
                debug!(%booted, %modified, "checking for reboot since last save");
                booted > modified
            }
            Err(e) => {
                warn!(error = %e, "failed to determine last reboot time");
                false
            }
        }
    }

    fn space(&self, id: &str) -> Result<&AddressSpace> {
        self.spaces.get(id).ok_or(IpamError::InvalidAddressSpace)
    }

    fn space_mut(&mut self, id: &str) -> Result<&mut AddressSpace> {
        self.spaces.get_mut(id).ok_or(IpamError::InvalidAddressSpace)
    }

    fn save(&mut self) -> Result<()> {
        let now = Utc::now();
        let state = PersistedStateRef {
            version: env!("CARGO_PKG_VERSION"),
            timestamp: now,
            address_spaces: &self.spaces,
        };
        self.store.write_typed(STORE_KEY, &state)?;
        self.last_saved = Some(now);
        Ok(())
    }

    fn save_or_log(&mut self) {
        if let Err(e) = self.save() {
            error!(error = %e, "failed to save address state");
        }
    }

    fn notify_network_plugin(&self, space_id: &str) {
        let (Some(hook), Some(space)) = (&self.network_plugin, self.spaces.get(space_id)) else {
            return;
        };
        if space.scope() != AddressScope::Local {
            return;
        }
        for pool in space.pools() {
            let subnet = pool.subnet();
            if let Err(e) = hook.add_external_interface(pool.if_name(), &subnet) {
                warn!(if_name = pool.if_name(), %subnet, error = %e, "network plugin rejected interface");
            }
        }
    }
}

impl AddressConfigSink for AddressBook {
    fn new_address_space(&self, id: &str, scope: AddressScope) -> Result<AddressSpace> {
        if id != LOCAL_DEFAULT_ADDRESS_SPACE && id != GLOBAL_DEFAULT_ADDRESS_SPACE {
            return Err(IpamError::InvalidAddressSpace);
        }
        Ok(AddressSpace::new(id, scope))
    }

    fn set_address_space(&mut self, space: AddressSpace) -> Result<()> {
        let id = space.id().to_string();
        let live = self
            .spaces
            .entry(id.clone())
            .or_insert_with(|| AddressSpace::new(id.clone(), space.scope()));
        let summary = live.merge(space);
        info!(
            space = %id,
            pools_added = summary.pools_added,
            addresses_added = summary.addresses_added,
            pools_removed = summary.pools_removed,
            "address space refreshed"
        );
        self.notify_network_plugin(&id);
        self.save_or_log();
        Ok(())
    }
}

struct ManagerState {
    book: AddressBook,
    source: Option<AddressSource>,
}

impl ManagerState {
    /// Gives the source a chance to publish. Failures are logged; callers
    /// carry on with the current state.
    async fn refresh(&mut self) {
        let Self { book, source } = self;
        if let Some(source) = source.as_mut() {
            if let Err(e) = source.refresh(book).await {
                warn!(source = source.name(), error = %e, "address source refresh failed");
            }
        }
    }
}

/// Thread-safe owner of all IPAM state.
///
/// Every operation runs under one lock: the source is refreshed, the
/// mutation applied and the result persisted before the next caller runs.
pub struct AddressManager {
    state: Mutex<ManagerState>,
    interfaces: Arc<dyn InterfaceLister>,
}

impl fmt::Debug for AddressManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressManager")
            .field("interfaces", &self.interfaces)
            .finish_non_exhaustive()
    }
}

impl AddressManager {
    /// Restores state from `store` and prepares the default address spaces.
    ///
    /// Leases are cleared if the host rebooted since the store was written
    /// or if [`ManagerOptions::rehydrate_on_reboot`] is set.
    pub fn initialize(store: Arc<dyn KeyValueStore>, options: ManagerOptions) -> Result<Self> {
        let mut book = AddressBook::new(store, options.network_plugin);
        book.restore(options.rehydrate_on_reboot)?;
        Ok(Self {
            state: Mutex::new(ManagerState { book, source: None }),
            interfaces: options
                .interfaces
                .unwrap_or_else(|| Arc::new(SystemInterfaces)),
        })
    }

    /// Starts the address source selected by `config`. A config without an
    /// environment starts nothing.
    pub async fn start_source(&self, config: &SourceConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.source.is_some() {
            return Err(IpamError::InvalidConfiguration(
                "an address source is already running".to_string(),
            ));
        }
        let Some(mut source) =
            AddressSource::from_config(config, Arc::clone(&self.interfaces)).await?
        else {
            info!("no address source configured");
            return Ok(());
        };
        source.start().await?;
        state.source = Some(source);
        Ok(())
    }

    /// Stops the address source, if one is running.
    pub async fn uninitialize(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut source) = state.source.take() {
            source.stop();
        }
    }

    /// Returns the IDs of the local and global default address spaces.
    pub async fn get_default_address_spaces(&self) -> (String, String) {
        self.state.lock().await.refresh().await;
        (
            LOCAL_DEFAULT_ADDRESS_SPACE.to_string(),
            GLOBAL_DEFAULT_ADDRESS_SPACE.to_string(),
        )
    }

    /// Reserves a pool in `as_id`, returning its ID and subnet.
    pub async fn request_pool(
        &self,
        as_id: &str,
        pool_id: &str,
        sub_pool_id: &str,
        options: &Options,
        v6: bool,
    ) -> Result<(String, String)> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.refresh().await;

        let pool = state
            .book
            .space_mut(as_id)?
            .request_pool(pool_id, sub_pool_id, options, v6)?;
        let reserved = (pool.id().to_string(), pool.subnet().to_string());
        info!(space = as_id, pool = %reserved.0, "pool requested");

        state.book.save_or_log();
        Ok(reserved)
    }

    /// Drops a reservation on a pool.
    pub async fn release_pool(&self, as_id: &str, pool_id: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.refresh().await;

        state.book.space_mut(as_id)?.release_pool(pool_id)?;
        info!(space = as_id, pool = pool_id, "pool released");

        state.book.save_or_log();
        Ok(())
    }

    /// Describes a pool.
    pub async fn get_pool_info(&self, as_id: &str, pool_id: &str) -> Result<PoolInfo> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.refresh().await;

        Ok(state.book.space(as_id)?.get_pool(pool_id)?.info())
    }

    /// Leases an address from a pool, returning it in CIDR form.
    ///
    /// The lease is rolled back if it cannot be persisted.
    pub async fn request_address(
        &self,
        as_id: &str,
        pool_id: &str,
        address: &str,
        options: &Options,
    ) -> Result<String> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.refresh().await;

        let grant = state
            .book
            .space_mut(as_id)?
            .request_address(pool_id, address, options)?;

        if let Err(e) = state.book.save() {
            if let Some(addr) = grant.fresh {
                state.book.space_mut(as_id)?.revoke_address(pool_id, addr);
            }
            error!(space = as_id, pool = pool_id, error = %e, "failed to persist lease");
            return Err(e);
        }
        info!(space = as_id, pool = pool_id, address = %grant.cidr, "address requested");
        Ok(grant.cidr)
    }

    /// Releases an address lease. With an address ID option, the lease is
    /// found by ID first.
    pub async fn release_address(
        &self,
        as_id: &str,
        pool_id: &str,
        address: &str,
        options: &Options,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.refresh().await;

        state
            .book
            .space_mut(as_id)?
            .release_address(pool_id, address, options)?;
        info!(space = as_id, pool = pool_id, address, "address released");

        state.book.save_or_log();
        Ok(())
    }

    /// Returns a copy of an address space.
    pub async fn address_space(&self, as_id: &str) -> Result<AddressSpace> {
        self.state.lock().await.book.space(as_id).cloned()
    }

    /// When the state was last persisted.
    pub async fn last_saved(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.book.last_saved
    }
}
