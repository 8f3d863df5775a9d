//! In-process store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::KeyValueStore;
use crate::error::{Result, StoreError};

/// A [`KeyValueStore`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
    modified: Mutex<Option<DateTime<Utc>>>,
    locked: Mutex<bool>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the reported modification time.
    ///
    /// Writes made after this call update the time as usual.
    #[must_use]
    pub fn with_modification_time(self, time: DateTime<Utc>) -> Self {
        *self.modified.lock() = Some(time);
        self
    }

    /// Returns whether the store lock is held.
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        self.data.lock().insert(key.to_string(), value);
        *self.modified.lock() = Some(Utc::now());
        Ok(())
    }

    fn modification_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.modified.lock())
    }

    fn lock(&self, _block: bool) -> Result<()> {
        *self.locked.lock() = true;
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let mut locked = self.locked.lock();
        if !*locked {
            return Err(StoreError::NotLocked);
        }
        *locked = false;
        Ok(())
    }
}
