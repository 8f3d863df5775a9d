//! Azure wireserver source.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use crate::error::{IpamError, Result};
use crate::platform::InterfaceLister;
use crate::space::{AddressScope, LOCAL_DEFAULT_ADDRESS_SPACE};

use super::discovery::{parse_interfaces_xml, populate};
use super::{AddressConfigSink, RefreshTimer};

/// Wireserver endpoint describing this VM's interfaces.
pub const DEFAULT_WIRESERVER_URL: &str =
    "http://168.63.129.16/machine/plugins?comp=nmagent&type=getinterfaceinfov1";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls the wireserver for the VM's interface configuration.
#[derive(Debug)]
pub struct WireserverSource {
    url: Url,
    timer: RefreshTimer,
    interfaces: Arc<dyn InterfaceLister>,
    client: Option<reqwest::Client>,
}

impl WireserverSource {
    /// Creates a source for `url`, or the well-known wireserver endpoint.
    pub fn new(
        url: Option<&str>,
        interval: Duration,
        interfaces: Arc<dyn InterfaceLister>,
    ) -> Result<Self> {
        let raw = url.unwrap_or(DEFAULT_WIRESERVER_URL);
        let url = Url::parse(raw).map_err(|e| {
            IpamError::InvalidConfiguration(format!("invalid query URL {raw:?}: {e}"))
        })?;
        Ok(Self {
            url,
            timer: RefreshTimer::new(interval),
            interfaces,
            client: None,
        })
    }

    /// Endpoint being polled.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        self.client = Some(client);
        info!(url = %self.url, "wireserver source started");
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        self.client = None;
    }

    pub(crate) async fn refresh<K: AddressConfigSink + Send>(&mut self, sink: &mut K) -> Result<()> {
        if !self.timer.start_if_due() {
            return Ok(());
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| IpamError::Source("wireserver source is not started".to_string()))?;

        debug!(url = %self.url, "querying wireserver");
        let body = client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let discovered = parse_interfaces_xml(&body)?;
        let host = self.interfaces.interfaces()?;

        let mut local = sink.new_address_space(LOCAL_DEFAULT_ADDRESS_SPACE, AddressScope::Local)?;
        populate(&mut local, &discovered, &host);
        sink.set_address_space(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FakeInterfaces;
    use crate::source::test_support::RecordingSink;

    fn source(interval: Duration) -> WireserverSource {
        WireserverSource::new(
            Some("http://127.0.0.1:9/unreachable"),
            interval,
            Arc::new(FakeInterfaces::new()),
        )
        .expect("source")
    }

    #[test]
    fn test_default_url() {
        let source = WireserverSource::new(None, Duration::ZERO, Arc::new(FakeInterfaces::new()))
            .expect("source");
        assert_eq!(source.url().host_str(), Some("168.63.129.16"));
    }

    #[test]
    fn test_invalid_url() {
        let result = WireserverSource::new(
            Some("::::"),
            Duration::ZERO,
            Arc::new(FakeInterfaces::new()),
        );
        assert!(matches!(result, Err(IpamError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_refresh_before_start_fails() {
        let mut source = source(Duration::ZERO);
        let mut sink = RecordingSink::default();
        let result = source.refresh(&mut sink).await;
        assert!(matches!(result, Err(IpamError::Source(_))));
        assert!(sink.received.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_is_rate_limited() {
        let mut source = source(Duration::from_secs(3600));
        source.start().expect("start");
        let mut sink = RecordingSink::default();

        // The first attempt is due and fails against the closed port.
        assert!(source.refresh(&mut sink).await.is_err());
        // The second is inside the interval and does nothing.
        assert!(source.refresh(&mut sink).await.is_ok());
        assert!(sink.received.is_empty());
    }
}
