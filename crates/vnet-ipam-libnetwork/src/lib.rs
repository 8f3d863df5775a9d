//! Docker libnetwork remote IPAM driver.
//!
//! Exposes the address manager over the libnetwork plugin protocol: JSON
//! POSTs on a unix socket (or TCP port), one path per method, errors
//! returned in-band as `{"Err": ..}`.

#![forbid(unsafe_code)]

pub mod api;
pub mod driver;
pub mod error;
pub mod listener;
pub mod spec_file;

pub use driver::IpamDriver;
pub use error::{PluginError, Result};
pub use listener::{ListenAddress, PluginHandler, PluginListener, Reply};
pub use spec_file::{DEFAULT_PLUGIN_SPEC_DIR, PluginSpecFile};
