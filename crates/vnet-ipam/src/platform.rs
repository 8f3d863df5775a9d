//! Host platform queries: network interfaces and boot time.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::{IpamError, Result};

/// A network interface present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    /// Interface name, e.g. `eth0`.
    pub name: String,
    /// Hardware address as lowercase hex without separators; empty if none.
    pub mac: String,
}

impl HostInterface {
    /// Creates an interface entry, normalizing the MAC address.
    pub fn new(name: impl Into<String>, mac: &str) -> Self {
        Self {
            name: name.into(),
            mac: normalize_mac(mac),
        }
    }
}

/// Enumerates the host's network interfaces.
pub trait InterfaceLister: Send + Sync + fmt::Debug {
    /// Returns the interfaces currently present.
    fn interfaces(&self) -> Result<Vec<HostInterface>>;
}

/// Reads interfaces from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceLister for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<HostInterface>> {
        Ok(netdev::get_interfaces()
            .into_iter()
            .map(|iface| {
                let mac = iface.mac_addr.map(|m| m.to_string()).unwrap_or_default();
                HostInterface::new(iface.name, &mac)
            })
            .collect())
    }
}

/// A fixed interface list for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct FakeInterfaces {
    interfaces: Vec<HostInterface>,
}

impl FakeInterfaces {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an interface.
    #[must_use]
    pub fn with_interface(mut self, name: &str, mac: &str) -> Self {
        self.interfaces.push(HostInterface::new(name, mac));
        self
    }
}

impl InterfaceLister for FakeInterfaces {
    fn interfaces(&self) -> Result<Vec<HostInterface>> {
        Ok(self.interfaces.clone())
    }
}

/// Lowercases a MAC address and strips `:` and `-` separators.
pub fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Returns when the host last booted.
#[cfg(target_os = "linux")]
pub fn last_reboot_time() -> Result<DateTime<Utc>> {
    let uptime = std::fs::read_to_string("/proc/uptime")
        .map_err(|e| IpamError::Source(format!("failed to read /proc/uptime: {e}")))?;
    let seconds: f64 = uptime
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| IpamError::Source(format!("malformed /proc/uptime: {uptime:?}")))?;
    Ok(Utc::now() - chrono::Duration::milliseconds((seconds * 1000.0) as i64))
}

/// Returns when the host last booted.
#[cfg(not(target_os = "linux"))]
pub fn last_reboot_time() -> Result<DateTime<Utc>> {
    Err(IpamError::Source(
        "last reboot time is not available on this platform".to_string(),
    ))
}

/// Default location of the interfaces file read by the file source.
pub fn default_interfaces_file() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"c:\k\interfaces.json")
    } else {
        PathBuf::from("/etc/kubernetes/interfaces.json")
    }
}
