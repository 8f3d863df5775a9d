//! Catch-all source for setups where another component assigns addresses.

use ipnet::{IpNet, Ipv4Net};

use crate::error::Result;
use crate::pool::PRIORITY_PRIMARY;
use crate::space::{AddressScope, LOCAL_DEFAULT_ADDRESS_SPACE};

use super::AddressConfigSink;

/// Publishes a single `0.0.0.0/0` pool with no addresses, once.
#[derive(Debug, Default)]
pub struct NullSource {
    initialized: bool,
}

impl NullSource {
    /// Creates the source.
    pub fn new() -> Self {
        Self::default()
    }

    /// The catch-all pool's subnet.
    pub fn subnet() -> IpNet {
        IpNet::V4(Ipv4Net::default())
    }

    pub(crate) fn refresh<K: AddressConfigSink>(&mut self, sink: &mut K) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let mut local = sink.new_address_space(LOCAL_DEFAULT_ADDRESS_SPACE, AddressScope::Local)?;
        local.new_pool("", PRIORITY_PRIMARY, Self::subnet())?;
        sink.set_address_space(local)?;
        self.initialized = true;
        Ok(())
    }
}
