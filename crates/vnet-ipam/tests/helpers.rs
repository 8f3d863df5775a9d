//! Shared fixtures for the address manager integration tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use vnet_ipam::{AddressManager, Environment, FakeInterfaces, ManagerOptions, SourceConfig};
use vnet_ipam_store::KeyValueStore;

/// MAC address of the fake host's only interface.
pub const ETH0_MAC: &str = "00:0d:3a:6e:2e:c4";

/// Builds a wireserver interface document for `eth0` with one subnet. The
/// first address is marked primary.
pub fn interfaces_xml(prefix: &str, addresses: &[&str]) -> String {
    let entries: String = addresses
        .iter()
        .enumerate()
        .map(|(i, addr)| format!(r#"<IPAddress Address="{addr}" IsPrimary="{}"/>"#, i == 0))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<Interfaces><Interface MacAddress="000D3A6E2EC4" IsPrimary="true"><IPSubnet Prefix="{prefix}">{entries}</IPSubnet></Interface></Interfaces>"#
    )
}

/// A wireserver stand-in serving a swappable XML body.
pub struct StubWireserver {
    pub url: String,
    body: Arc<Mutex<String>>,
    status: Arc<Mutex<StatusCode>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl StubWireserver {
    /// Starts serving `body` on a loopback port.
    pub async fn start(body: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let body = Arc::new(Mutex::new(body));
        let status = Arc::new(Mutex::new(StatusCode::OK));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let (served_body, served_status) = (body.clone(), status.clone());
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                };
                let (body, status) = (served_body.clone(), served_status.clone());
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let mut response = Response::new(Full::new(Bytes::from(body.lock().clone())));
                        *response.status_mut() = *status.lock();
                        async move { Ok::<_, Infallible>(response) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            url: format!("http://{addr}/machine/plugins?comp=nmagent&type=getinterfaceinfov1"),
            body,
            status,
            shutdown: Some(shutdown_tx),
        }
    }

    /// Replaces the served document.
    pub fn set_body(&self, body: String) {
        *self.body.lock() = body;
    }

    /// Makes the server answer with `status`.
    pub fn set_status(&self, status: StatusCode) {
        *self.status.lock() = status;
    }
}

impl Drop for StubWireserver {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Source config polling `url` on every operation.
pub fn wireserver_config(url: &str) -> SourceConfig {
    SourceConfig {
        environment: Environment::Azure,
        query_url: Some(url.to_string()),
        query_interval: Some(0),
        ..SourceConfig::default()
    }
}

/// A manager over `store` whose host has only `eth0`.
pub fn manager_with(store: Arc<dyn KeyValueStore>, options: ManagerOptions) -> AddressManager {
    let options = ManagerOptions {
        interfaces: Some(Arc::new(FakeInterfaces::new().with_interface("eth0", ETH0_MAC))),
        ..options
    };
    AddressManager::initialize(store, options).expect("initialize")
}

/// A manager fed by a stub wireserver serving `addresses` in `prefix`.
pub async fn manager_on_wireserver(
    store: Arc<dyn KeyValueStore>,
    prefix: &str,
    addresses: &[&str],
) -> (AddressManager, StubWireserver) {
    let server = StubWireserver::start(interfaces_xml(prefix, addresses)).await;
    let manager = manager_with(store, ManagerOptions::default());
    manager
        .start_source(&wireserver_config(&server.url))
        .await
        .expect("start source");
    (manager, server)
}
