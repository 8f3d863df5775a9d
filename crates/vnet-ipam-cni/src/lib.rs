//! CNI IPAM plugin.
//!
//! The container runtime runs the binary once per operation with the
//! command in `CNI_COMMAND` and the network configuration on stdin. Every
//! invocation restores the address manager from the shared store, runs one
//! operation, persists and exits.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod plugin;
pub mod result;

pub use config::{DEFAULT_CNI_VERSION, IpamConfig, NetworkConfig};
pub use error::{CniError, ErrorOutput, Result};
pub use plugin::{CniCommand, CniPlugin};
pub use result::{IpamResult, SUPPORTED_VERSIONS, VersionResult};
