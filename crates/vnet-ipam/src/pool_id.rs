//! External pool identifiers.
//!
//! Plugin shells name a pool with a pipe-delimited triple
//! `asId|subnet|childSubnet`. Trailing segments may be omitted.

use std::fmt;
use std::str::FromStr;

use crate::error::IpamError;

const SEPARATOR: char = '|';

/// A pool identifier scoped to an address space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PoolId {
    /// Address space ID.
    pub as_id: String,
    /// Pool subnet in CIDR form.
    pub subnet: String,
    /// Child subnet in CIDR form, empty when the pool is not subdivided.
    pub child_subnet: String,
}

impl PoolId {
    /// Creates a pool identifier.
    pub fn new(
        as_id: impl Into<String>,
        subnet: impl Into<String>,
        child_subnet: impl Into<String>,
    ) -> Self {
        Self {
            as_id: as_id.into(),
            subnet: subnet.into(),
            child_subnet: child_subnet.into(),
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.as_id, self.subnet)?;
        if !self.child_subnet.is_empty() {
            write!(f, "{SEPARATOR}{}", self.child_subnet)?;
        }
        Ok(())
    }
}

impl FromStr for PoolId {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(SEPARATOR);
        let as_id = parts.next().unwrap_or_default();
        let subnet = parts.next().unwrap_or_default();
        let child_subnet = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return Err(IpamError::InvalidPool);
        }
        Ok(Self::new(as_id, subnet, child_subnet))
    }
}
