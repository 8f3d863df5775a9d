//! Address records.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// One host IP address belonging to one pool.
///
/// The generation epoch and the unhealthy flag are runtime state only; a
/// restored record starts at epoch zero and healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Addr")]
    addr: IpAddr,
    #[serde(rename = "InUse", default)]
    in_use: bool,
    #[serde(skip)]
    unhealthy: bool,
    #[serde(skip)]
    epoch: u64,
}

impl AddressRecord {
    pub(crate) fn new(addr: IpAddr) -> Self {
        Self {
            id: String::new(),
            addr,
            in_use: false,
            unhealthy: false,
            epoch: 0,
        }
    }

    /// The record's address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Lease ID of the current holder; empty when unleased or leased anonymously.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the address is leased.
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Whether the address vanished from discovery while leased.
    pub fn unhealthy(&self) -> bool {
        self.unhealthy
    }

    /// Generation in which discovery last reported this address.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn lease(&mut self, id: &str) {
        self.in_use = true;
        self.id = id.to_string();
    }

    pub(crate) fn clear_lease(&mut self) {
        self.in_use = false;
        self.id.clear();
    }

    pub(crate) fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub(crate) fn set_unhealthy(&mut self, unhealthy: bool) {
        self.unhealthy = unhealthy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_and_clear() {
        let mut record = AddressRecord::new("10.0.0.5".parse().expect("ip"));
        assert!(!record.in_use());

        record.lease("container-a");
        assert!(record.in_use());
        assert_eq!(record.id(), "container-a");

        record.clear_lease();
        assert!(!record.in_use());
        assert!(record.id().is_empty());
    }

    #[test]
    fn test_persisted_fields() {
        let mut record = AddressRecord::new("10.0.0.5".parse().expect("ip"));
        record.lease("A");
        record.set_epoch(9);
        record.set_unhealthy(true);

        let json = serde_json::to_value(&record).expect("encode");
        assert_eq!(
            json,
            serde_json::json!({"ID": "A", "Addr": "10.0.0.5", "InUse": true})
        );

        let restored: AddressRecord = serde_json::from_value(json).expect("decode");
        assert_eq!(restored.epoch(), 0);
        assert!(!restored.unhealthy());
        assert!(restored.in_use());
    }
}
