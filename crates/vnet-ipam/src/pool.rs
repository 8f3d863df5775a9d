//! Address pools and address leasing.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IpamError, Result};
use crate::options::{self, OPT_ADDRESS_ID, Options};
use crate::record::AddressRecord;

/// The cloud DNS proxy handed to every container.
pub const DNS_PROXY: IpAddr = IpAddr::V4(Ipv4Addr::new(168, 63, 129, 16));

/// Pool priority of subnets on the host's primary interface.
pub const PRIORITY_PRIMARY: i32 = 0;

/// Pool priority of subnets on secondary interfaces.
pub const PRIORITY_SECONDARY: i32 = 1;

/// One subnet on one host interface and the leasable addresses in it.
///
/// Records are owned by the address map. The lease-ID index refers into it
/// by address and is rebuilt after a restore with [`AddressPool::rebuild_id_index`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPool {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "IfName")]
    if_name: String,
    #[serde(rename = "Subnet")]
    subnet: IpNet,
    #[serde(rename = "Gateway")]
    gateway: IpAddr,
    #[serde(rename = "IsIPv6")]
    is_ipv6: bool,
    #[serde(rename = "Priority")]
    priority: i32,
    #[serde(rename = "RefCount")]
    ref_count: u32,
    #[serde(rename = "Addresses", default)]
    addresses: BTreeMap<IpAddr, AddressRecord>,
    #[serde(skip)]
    by_id: HashMap<String, IpAddr>,
    #[serde(skip)]
    epoch: u64,
}

/// Snapshot of a pool returned by `get_pool_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    /// Pool subnet.
    pub subnet: IpNet,
    /// Gateway pseudo-address.
    pub gateway: IpAddr,
    /// DNS servers for containers on this pool.
    pub dns_servers: Vec<IpAddr>,
    /// Whether the subnet is IPv6.
    pub is_ipv6: bool,
    /// Number of address records.
    pub capacity: usize,
    /// Number of records not leased.
    pub available: usize,
    /// Leased addresses that vanished from discovery.
    pub unhealthy_addresses: Vec<IpAddr>,
}

/// Outcome of a successful address request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Grant {
    /// The leased address in `ip/prefix` form.
    pub cidr: String,
    /// The record newly moved to in-use, if this call moved one.
    pub fresh: Option<IpAddr>,
}

impl AddressPool {
    /// Creates an empty pool for `subnet` on `if_name`.
    ///
    /// Host bits of `subnet` are cleared; the pool ID is the resulting CIDR.
    pub fn new(if_name: impl Into<String>, subnet: IpNet, priority: i32) -> Self {
        let subnet = subnet.trunc();
        Self {
            id: subnet.to_string(),
            if_name: if_name.into(),
            subnet,
            gateway: gateway_of(&subnet),
            is_ipv6: matches!(subnet, IpNet::V6(_)),
            priority,
            ref_count: 0,
            addresses: BTreeMap::new(),
            by_id: HashMap::new(),
            epoch: 0,
        }
    }

    /// Pool ID (the subnet CIDR).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host interface the subnet belongs to.
    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    /// Pool subnet.
    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    /// Gateway pseudo-address: the subnet's network address with host ID 1.
    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    /// Whether the subnet is IPv6.
    pub fn is_ipv6(&self) -> bool {
        self.is_ipv6
    }

    /// Selection priority; higher wins.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Number of outstanding pool reservations.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether any caller holds a pool reservation.
    pub fn is_in_use(&self) -> bool {
        self.ref_count > 0
    }

    /// Generation in which discovery last reported this pool.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of address records.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether the pool has no address records.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Returns the record for `addr`.
    pub fn record(&self, addr: IpAddr) -> Option<&AddressRecord> {
        self.addresses.get(&addr)
    }

    /// Iterates records in address order.
    pub fn records(&self) -> impl Iterator<Item = &AddressRecord> {
        self.addresses.values()
    }

    /// Returns the address leased under `id`.
    pub fn address_for_id(&self, id: &str) -> Option<IpAddr> {
        self.by_id.get(id).copied()
    }

    /// Adds a record for `addr`.
    pub fn new_address_record(&mut self, addr: IpAddr) -> Result<&mut AddressRecord> {
        if !self.subnet.contains(&addr) {
            return Err(IpamError::InvalidAddress);
        }
        if self.addresses.contains_key(&addr) {
            return Err(IpamError::AddressExists);
        }
        Ok(self
            .addresses
            .entry(addr)
            .or_insert_with(|| AddressRecord::new(addr)))
    }

    /// Summarizes the pool.
    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            subnet: self.subnet,
            gateway: self.gateway,
            dns_servers: vec![DNS_PROXY],
            is_ipv6: self.is_ipv6,
            capacity: self.addresses.len(),
            available: self.addresses.values().filter(|r| !r.in_use()).count(),
            unhealthy_addresses: self
                .addresses
                .values()
                .filter(|r| r.unhealthy())
                .map(AddressRecord::addr)
                .collect(),
        }
    }

    pub(crate) fn acquire(&mut self) {
        self.ref_count += 1;
    }

    pub(crate) fn release(&mut self) -> Result<()> {
        if !self.is_in_use() {
            return Err(IpamError::PoolNotInUse);
        }
        self.ref_count -= 1;
        Ok(())
    }

    pub(crate) fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Leases an address from the pool.
    ///
    /// An explicit `address` wins; otherwise the gateway option, then a
    /// replay of the caller's lease ID, then the first free record.
    pub(crate) fn request_address(&mut self, address: &str, options: &Options) -> Result<Grant> {
        let lease_id = options::non_empty(options, OPT_ADDRESS_ID).unwrap_or_default();
        let explicit = parse_address(address)?;

        if explicit.is_none() && options::wants_gateway(options) {
            return Ok(Grant {
                cidr: self.cidr_of(self.gateway),
                fresh: None,
            });
        }

        let addr = match explicit {
            Some(addr) => {
                let record = self.addresses.get(&addr).ok_or(IpamError::AddressNotFound)?;
                if record.in_use() && (lease_id.is_empty() || record.id() != lease_id) {
                    return Err(IpamError::AddressInUse);
                }
                addr
            }
            None => self
                .replayed(lease_id)
                .or_else(|| self.first_free())
                .ok_or(IpamError::NoAvailableAddresses)?,
        };

        let record = self
            .addresses
            .get_mut(&addr)
            .ok_or(IpamError::AddressNotFound)?;
        let fresh = !record.in_use();
        record.lease(lease_id);
        if !lease_id.is_empty() {
            self.by_id.insert(lease_id.to_string(), addr);
        }

        debug!(pool = %self.id, %addr, id = lease_id, fresh, "address leased");
        Ok(Grant {
            cidr: self.cidr_of(addr),
            fresh: fresh.then_some(addr),
        })
    }

    /// Undoes a lease granted by [`AddressPool::request_address`].
    pub(crate) fn revoke(&mut self, addr: IpAddr) {
        if let Some(record) = self.addresses.get_mut(&addr) {
            if self.by_id.get(record.id()) == Some(&addr) {
                self.by_id.remove(record.id());
            }
            record.clear_lease();
        }
    }

    /// Releases a lease. Records that vanished from discovery before
    /// `space_epoch` are dropped once free.
    pub(crate) fn release_address(
        &mut self,
        address: &str,
        options: &Options,
        space_epoch: u64,
    ) -> Result<()> {
        let explicit = parse_address(address)?;
        if explicit == Some(self.gateway) {
            return Ok(());
        }

        let addr = options::non_empty(options, OPT_ADDRESS_ID)
            .and_then(|id| self.by_id.get(id).copied())
            .or(explicit)
            .ok_or(IpamError::AddressNotFound)?;

        let record = self
            .addresses
            .get_mut(&addr)
            .ok_or(IpamError::AddressNotFound)?;
        if !record.in_use() {
            return Err(IpamError::AddressNotInUse);
        }

        if self.by_id.get(record.id()) == Some(&addr) {
            self.by_id.remove(record.id());
        }
        record.clear_lease();

        if record.epoch() < space_epoch {
            debug!(pool = %self.id, %addr, "dropping released stale address");
            self.addresses.remove(&addr);
        }
        Ok(())
    }

    /// Folds a freshly discovered copy of this pool into it.
    ///
    /// New records are adopted; known records only get their epoch bumped so
    /// their lease state survives.
    pub(crate) fn absorb(&mut self, incoming: AddressPool, epoch: u64) -> usize {
        let mut added = 0;
        for (addr, mut record) in incoming.addresses {
            match self.addresses.get_mut(&addr) {
                Some(existing) => {
                    existing.set_epoch(epoch);
                    existing.set_unhealthy(false);
                }
                None => {
                    record.set_epoch(epoch);
                    self.addresses.insert(addr, record);
                    added += 1;
                }
            }
        }
        self.epoch = epoch;
        added
    }

    /// Stamps the pool and all of its records with `epoch`.
    pub(crate) fn stamp(&mut self, epoch: u64) {
        self.epoch = epoch;
        for record in self.addresses.values_mut() {
            record.set_epoch(epoch);
        }
    }

    /// Drops free records older than `epoch` and flags leased ones unhealthy.
    /// Returns whether any record is current or leased.
    pub(crate) fn collect_stale(&mut self, epoch: u64) -> bool {
        let mut pinned = false;
        self.addresses.retain(|_, record| {
            if record.epoch() >= epoch {
                pinned = true;
                return true;
            }
            if record.in_use() {
                record.set_unhealthy(true);
                pinned = true;
                return true;
            }
            false
        });
        pinned
    }

    /// Forgets every lease and reservation, keeping the records.
    pub(crate) fn reset_leases(&mut self) {
        for record in self.addresses.values_mut() {
            record.clear_lease();
        }
        self.by_id.clear();
        self.ref_count = 0;
    }

    /// Rebuilds the lease-ID index from the records.
    pub(crate) fn rebuild_id_index(&mut self) {
        self.by_id = self
            .addresses
            .values()
            .filter(|r| !r.id().is_empty())
            .map(|r| (r.id().to_string(), r.addr()))
            .collect();
    }

    fn replayed(&self, lease_id: &str) -> Option<IpAddr> {
        if lease_id.is_empty() {
            return None;
        }
        self.by_id
            .get(lease_id)
            .copied()
            .filter(|addr| self.addresses.contains_key(addr))
    }

    fn first_free(&self) -> Option<IpAddr> {
        self.addresses
            .values()
            .find(|r| !r.in_use())
            .map(AddressRecord::addr)
    }

    fn cidr_of(&self, addr: IpAddr) -> String {
        format!("{addr}/{}", self.subnet.prefix_len())
    }
}

fn gateway_of(subnet: &IpNet) -> IpAddr {
    match subnet.network() {
        IpAddr::V4(network) => IpAddr::V4(Ipv4Addr::from(u32::from(network) | 1)),
        IpAddr::V6(network) => IpAddr::V6(Ipv6Addr::from(u128::from(network) | 1)),
    }
}

/// Parses an address argument. Empty means "none"; a prefix suffix is ignored.
fn parse_address(address: &str) -> Result<Option<IpAddr>> {
    let address = address.trim();
    if address.is_empty() {
        return Ok(None);
    }
    let host = address.split_once('/').map_or(address, |(host, _)| host);
    host.parse()
        .map(Some)
        .map_err(|_| IpamError::InvalidAddress)
}
