//! JSON key-value persistence for the vnet IPAM state.
//!
//! The IPAM core treats its store as an opaque key-value interface with a
//! modification timestamp and an advisory lock. [`JsonFileStore`] keeps every
//! key in one JSON object on disk and replaces the file atomically on each
//! write; [`MemoryStore`] keeps the same object in process memory.

#![forbid(unsafe_code)]

pub mod error;
mod file;
mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use error::{Result, StoreError};
pub use file::{DEFAULT_LOCK_TIMEOUT, JsonFileStore};
pub use memory::MemoryStore;

/// A key-value store holding JSON documents.
pub trait KeyValueStore: Send + Sync {
    /// Returns the document stored under `key`, or `None` if the key is absent.
    fn read(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value` under `key`, replacing any previous document.
    fn write(&self, key: &str, value: Value) -> Result<()>;

    /// Returns when the store was last written, or `None` if it was never written.
    fn modification_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Acquires the store lock. With `block` set, waits up to the lock timeout.
    fn lock(&self, block: bool) -> Result<()>;

    /// Releases the store lock.
    fn unlock(&self) -> Result<()>;
}

impl dyn KeyValueStore {
    /// Reads and decodes the document stored under `key`.
    pub fn read_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Encodes `value` and stores it under `key`.
    pub fn write_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.write(key, serde_json::to_value(value)?)
    }
}
