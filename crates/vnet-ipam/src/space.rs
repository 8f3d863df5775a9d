//! Address spaces and the generational merge.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{IpamError, Result};
use crate::options::{self, OPT_INTERFACE_NAME, Options};
use crate::pool::{AddressPool, Grant};

/// ID of the local default address space.
pub const LOCAL_DEFAULT_ADDRESS_SPACE: &str = "local";

/// ID of the global default address space.
pub const GLOBAL_DEFAULT_ADDRESS_SPACE: &str = "global";

/// Visibility of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressScope {
    /// Addresses meaningful only on this host.
    Local,
    /// Addresses meaningful across hosts.
    Global,
}

impl fmt::Display for AddressScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Global => write!(f, "global"),
        }
    }
}

impl FromStr for AddressScope {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            _ => Err(IpamError::InvalidScope),
        }
    }
}

/// A set of pools sharing one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSpace {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Scope")]
    scope: AddressScope,
    #[serde(rename = "Pools", default)]
    pools: BTreeMap<String, AddressPool>,
    #[serde(skip)]
    epoch: u64,
}

/// Counts from one merge, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Pools adopted from discovery.
    pub pools_added: usize,
    /// Records adopted into pools that already existed.
    pub addresses_added: usize,
    /// Pools collected because they vanished and were unused.
    pub pools_removed: usize,
}

impl AddressSpace {
    /// Creates an empty space.
    pub fn new(id: impl Into<String>, scope: AddressScope) -> Self {
        Self {
            id: id.into(),
            scope,
            pools: BTreeMap::new(),
            epoch: 0,
        }
    }

    /// Space ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Space scope.
    pub fn scope(&self) -> AddressScope {
        self.scope
    }

    /// Current generation; advanced by every merge.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Iterates pools in ID order.
    pub fn pools(&self) -> impl Iterator<Item = &AddressPool> {
        self.pools.values()
    }

    /// Adds an empty pool for `subnet` on `if_name`.
    pub fn new_pool(
        &mut self,
        if_name: &str,
        priority: i32,
        subnet: IpNet,
    ) -> Result<&mut AddressPool> {
        let pool = AddressPool::new(if_name, subnet, priority);
        if self.pools.contains_key(pool.id()) {
            return Err(IpamError::PoolExists);
        }
        Ok(self.pools.entry(pool.id().to_string()).or_insert(pool))
    }

    /// Looks up a pool by ID.
    pub fn get_pool(&self, pool_id: &str) -> Result<&AddressPool> {
        let key = self.pool_key(pool_id)?;
        self.pools.get(&key).ok_or(IpamError::PoolNotFound)
    }

    fn get_pool_mut(&mut self, pool_id: &str) -> Result<&mut AddressPool> {
        let key = self.pool_key(pool_id)?;
        self.pools.get_mut(&key).ok_or(IpamError::PoolNotFound)
    }

    /// Resolves a caller-supplied pool ID to the map key. Exact IDs pass
    /// through; other CIDR spellings of the same subnet are normalized.
    fn pool_key(&self, pool_id: &str) -> Result<String> {
        if self.pools.contains_key(pool_id) {
            return Ok(pool_id.to_string());
        }
        let subnet: IpNet = pool_id.parse().map_err(|_| IpamError::PoolNotFound)?;
        Ok(subnet.trunc().to_string())
    }

    /// Reserves a pool.
    ///
    /// An explicit `pool_id` is returned even if already reserved. An empty
    /// `pool_id` selects among unreserved pools of the requested family,
    /// optionally on one interface, preferring higher priority and then more
    /// addresses. `sub_pool_id` is accepted but child subnets are not carved.
    pub fn request_pool(
        &mut self,
        pool_id: &str,
        sub_pool_id: &str,
        options: &Options,
        v6: bool,
    ) -> Result<&AddressPool> {
        let key = if pool_id.is_empty() {
            let if_name = options::non_empty(options, OPT_INTERFACE_NAME);
            self.pools
                .values()
                .filter(|pool| !pool.is_in_use())
                .filter(|pool| pool.is_ipv6() == v6)
                .filter(|pool| if_name.is_none_or(|name| pool.if_name() == name))
                .max_by(|a, b| {
                    a.priority()
                        .cmp(&b.priority())
                        .then(a.len().cmp(&b.len()))
                })
                .map(|pool| pool.id().to_string())
                .ok_or(IpamError::NoAvailablePools)?
        } else {
            self.pool_key(pool_id)?
        };

        let pool = self.pools.get_mut(&key).ok_or(IpamError::PoolNotFound)?;
        pool.acquire();
        debug!(
            space = %self.id,
            pool = %key,
            sub_pool = sub_pool_id,
            ref_count = pool.ref_count(),
            "pool reserved"
        );
        Ok(pool)
    }

    /// Drops a pool reservation, collecting the pool if it vanished from
    /// discovery and is no longer reserved.
    pub fn release_pool(&mut self, pool_id: &str) -> Result<()> {
        let epoch = self.epoch;
        let pool = self.get_pool_mut(pool_id)?;
        pool.release()?;
        if !pool.is_in_use() && pool.epoch() < epoch {
            let key = pool.id().to_string();
            self.pools.remove(&key);
            info!(space = %self.id, pool = %key, "collected stale pool");
        }
        Ok(())
    }

    pub(crate) fn request_address(
        &mut self,
        pool_id: &str,
        address: &str,
        options: &Options,
    ) -> Result<Grant> {
        self.get_pool_mut(pool_id)?.request_address(address, options)
    }

    pub(crate) fn revoke_address(&mut self, pool_id: &str, addr: std::net::IpAddr) {
        if let Ok(pool) = self.get_pool_mut(pool_id) {
            pool.revoke(addr);
        }
    }

    pub(crate) fn release_address(
        &mut self,
        pool_id: &str,
        address: &str,
        options: &Options,
    ) -> Result<()> {
        let epoch = self.epoch;
        self.get_pool_mut(pool_id)?
            .release_address(address, options, epoch)
    }

    /// Merges a freshly discovered snapshot into this space.
    ///
    /// Discovered pools and records are adopted or have their epoch
    /// refreshed. Afterwards, free records that were not rediscovered are
    /// dropped, leased ones are kept and flagged unhealthy, and pools that
    /// were not rediscovered are dropped unless reserved or pinned by a
    /// leased record.
    pub fn merge(&mut self, incoming: AddressSpace) -> MergeSummary {
        self.epoch += 1;
        let epoch = self.epoch;
        let mut summary = MergeSummary::default();

        for (key, mut pool) in incoming.pools {
            match self.pools.get_mut(&key) {
                Some(existing) => {
                    summary.addresses_added += existing.absorb(pool, epoch);
                }
                None => {
                    pool.stamp(epoch);
                    self.pools.insert(key, pool);
                    summary.pools_added += 1;
                }
            }
        }

        for pool in self.pools.values_mut() {
            if pool.collect_stale(epoch) {
                pool.set_epoch(epoch);
            }
        }

        let before = self.pools.len();
        self.pools
            .retain(|_, pool| pool.epoch() >= epoch || pool.is_in_use());
        summary.pools_removed = before - self.pools.len();

        debug!(space = %self.id, epoch, ?summary, "address space merged");
        summary
    }

    /// Forgets every lease and reservation, keeping the records.
    pub(crate) fn reset_leases(&mut self) {
        for pool in self.pools.values_mut() {
            pool.reset_leases();
        }
    }

    /// Rebuilds per-pool lease-ID indexes after a restore.
    pub(crate) fn rebuild_indexes(&mut self) {
        for pool in self.pools.values_mut() {
            pool.rebuild_id_index();
        }
    }
}
