//! Error types for the libnetwork driver shell.

use std::io;

use thiserror::Error;

/// Errors raised while setting up or running the plugin endpoint.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The listen URL is malformed or uses an unsupported scheme.
    #[error("invalid listen URL {url:?}: {reason}")]
    InvalidListenUrl {
        /// The URL as given.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A socket or file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for the plugin shell.
pub type Result<T> = std::result::Result<T, PluginError>;
