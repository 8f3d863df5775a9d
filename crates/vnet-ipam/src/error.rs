//! Error types for the IPAM core.
//!
//! The `Display` text of each variant is the message the plugin shells
//! hand back to their callers.

use thiserror::Error;
use vnet_ipam_store::StoreError;

/// Errors that can occur in address management.
#[derive(Debug, Error)]
pub enum IpamError {
    /// The address space ID is unknown.
    #[error("Invalid address space")]
    InvalidAddressSpace,

    /// The pool ID is malformed.
    #[error("Invalid address pool")]
    InvalidPool,

    /// The address string is malformed or outside the pool's subnet.
    #[error("Invalid address")]
    InvalidAddress,

    /// The address space scope is unknown.
    #[error("Invalid scope")]
    InvalidScope,

    /// A configuration value is missing or malformed.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A pool with the same ID already exists in the space.
    #[error("Address pool already exists")]
    PoolExists,

    /// The pool ID does not name a pool in the space.
    #[error("Address pool not found")]
    PoolNotFound,

    /// The pool is reserved by another caller.
    #[error("Address pool already in use")]
    PoolInUse,

    /// The pool has no outstanding reservation to release.
    #[error("Address pool not in use")]
    PoolNotInUse,

    /// No pool satisfies the selection filters.
    #[error("No available address pools")]
    NoAvailablePools,

    /// A record for the address already exists in the pool.
    #[error("Address already exists")]
    AddressExists,

    /// The address is not a record of the pool.
    #[error("Address not found")]
    AddressNotFound,

    /// The address is leased to another caller.
    #[error("Address already in use")]
    AddressInUse,

    /// The address has no lease to release.
    #[error("Address not in use")]
    AddressNotInUse,

    /// Every record of the pool is leased.
    #[error("No available addresses")]
    NoAvailableAddresses,

    /// The persistent store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An address source returned unusable data.
    #[error("address source error: {0}")]
    Source(String),

    /// An HTTP query to an address source failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A Kubernetes API call failed.
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Result type for IPAM operations.
pub type Result<T> = std::result::Result<T, IpamError>;
