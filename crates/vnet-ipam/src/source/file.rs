//! Interfaces-file source, used on Azure Stack and with file-based IPAM.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::error::{IpamError, Result};
use crate::platform::{InterfaceLister, default_interfaces_file};
use crate::space::{AddressScope, LOCAL_DEFAULT_ADDRESS_SPACE};

use super::AddressConfigSink;
use super::discovery::{parse_interfaces_json, populate};

/// Loads the interface configuration from a JSON file once.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    loaded: bool,
    interfaces: Arc<dyn InterfaceLister>,
}

impl FileSource {
    /// Creates a source reading `path`, or the platform default.
    pub fn new(path: Option<PathBuf>, interfaces: Arc<dyn InterfaceLister>) -> Self {
        Self {
            path: path.unwrap_or_else(default_interfaces_file),
            loaded: false,
            interfaces,
        }
    }

    /// File being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn refresh<K: AddressConfigSink + Send>(&mut self, sink: &mut K) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            IpamError::Source(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let discovered = parse_interfaces_json(&json)?;
        let host = self.interfaces.interfaces()?;

        let mut local = sink.new_address_space(LOCAL_DEFAULT_ADDRESS_SPACE, AddressScope::Local)?;
        populate(&mut local, &discovered, &host);
        sink.set_address_space(local)?;

        self.loaded = true;
        info!(path = %self.path.display(), "interfaces file loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FakeInterfaces;
    use crate::source::test_support::RecordingSink;
    use std::io::Write;

    const INTERFACES: &str = r#"{
        "Interfaces": [{
            "MacAddress": "*",
            "IsPrimary": true,
            "IPSubnets": [{
                "Prefix": "192.168.1.0/24",
                "IPAddresses": [
                    {"Address": "192.168.1.4", "IsPrimary": true},
                    {"Address": "192.168.1.5", "IsPrimary": false},
                    {"Address": "192.168.1.6", "IsPrimary": false}
                ]
            }]
        }]
    }"#;

    #[tokio::test]
    async fn test_loads_once() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(INTERFACES.as_bytes()).expect("write");

        let interfaces = Arc::new(FakeInterfaces::new().with_interface("eth0", "00:11:22:33:44:55"));
        let mut source = FileSource::new(Some(file.path().to_path_buf()), interfaces);
        let mut sink = RecordingSink::default();

        source.refresh(&mut sink).await.expect("refresh");
        source.refresh(&mut sink).await.expect("second refresh");

        assert_eq!(sink.received.len(), 1);
        let pool = sink.received[0].get_pool("192.168.1.0/24").expect("pool");
        assert_eq!(pool.if_name(), "eth0");
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_retries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("interfaces.json");
        let interfaces = Arc::new(FakeInterfaces::new().with_interface("eth0", "00:11:22:33:44:55"));
        let mut source = FileSource::new(Some(path.clone()), interfaces);
        let mut sink = RecordingSink::default();

        assert!(matches!(
            source.refresh(&mut sink).await,
            Err(IpamError::Source(_))
        ));

        std::fs::write(&path, INTERFACES).expect("write");
        source.refresh(&mut sink).await.expect("refresh");
        assert_eq!(sink.received.len(), 1);
    }

    #[test]
    fn test_default_path() {
        let source = FileSource::new(None, Arc::new(FakeInterfaces::new()));
        assert_eq!(source.path(), default_interfaces_file());
    }
}
