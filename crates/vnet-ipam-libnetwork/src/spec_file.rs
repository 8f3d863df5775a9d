//! Docker plugin discovery files.
//!
//! Docker finds unix-socket plugins by socket name. A TCP plugin needs a
//! `<name>.spec` file holding its URL in one of the plugin directories.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;

/// Default directory Docker scans for plugin spec files.
pub const DEFAULT_PLUGIN_SPEC_DIR: &str = "/etc/docker/plugins";

/// A written spec file, removed on [`PluginSpecFile::remove`].
#[derive(Debug)]
pub struct PluginSpecFile {
    path: PathBuf,
}

impl PluginSpecFile {
    /// Writes `url` to `<dir>/<name>.spec`.
    pub fn write(dir: &Path, name: &str, url: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.spec"));
        std::fs::write(&path, url)?;
        info!(path = %path.display(), url, "wrote plugin spec file");
        Ok(Self { path })
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file.
    pub fn remove(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove plugin spec file");
        }
    }
}
