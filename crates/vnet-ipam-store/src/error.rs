//! Error types for the key-value store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// The store contents could not be encoded or decoded.
    #[error("store encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Another process held the lock for longer than the lock timeout.
    #[error("timed out waiting for store lock {}", path.display())]
    LockTimeout {
        /// Path of the contended lock file.
        path: PathBuf,
    },

    /// Unlock was called without holding the lock.
    #[error("store is not locked")]
    NotLocked,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_display() {
        let err = StoreError::LockTimeout {
            path: PathBuf::from("/var/run/ipam.json.lock"),
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for store lock /var/run/ipam.json.lock"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io_err.into();
        assert!(err.to_string().contains("store io error"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid");
        let err: StoreError = serde_err.into();
        assert!(err.to_string().contains("store encoding error"));
    }
}
