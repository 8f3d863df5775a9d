//! HTTP endpoint for plugin calls, on a unix socket or TCP port.
//!
//! Every call is a POST whose path names the method. The body is handed to
//! a [`PluginHandler`] and its [`Reply`] is written back as JSON.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::api::ErrorResponse;
use crate::error::{PluginError, Result};

/// Media type of plugin API payloads.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one plugin call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Encoded success payload.
    Success(Vec<u8>),
    /// The call failed; sent as `{"Err": ..}` with status 200.
    Failure(String),
    /// The request body could not be decoded; sent with status 400.
    BadRequest(String),
    /// No such method.
    NotFound,
}

impl Reply {
    /// Encodes a success payload.
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::Success(body),
            Err(e) => Self::Failure(e.to_string()),
        }
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let (status, body) = match self {
            Self::Success(body) => (StatusCode::OK, body),
            Self::Failure(err) => (StatusCode::OK, error_body(err)),
            Self::BadRequest(err) => (StatusCode::BAD_REQUEST, error_body(err)),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                error_body("unknown method".to_string()),
            ),
        };
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static(PLUGIN_CONTENT_TYPE));
        response
    }
}

fn error_body(err: String) -> Vec<u8> {
    serde_json::to_vec(&ErrorResponse { err }).unwrap_or_default()
}

/// Serves plugin methods.
pub trait PluginHandler: Send + Sync + 'static {
    /// Handles the call to `method` (the request path) with `body`.
    fn handle(&self, method: &str, body: Bytes) -> impl Future<Output = Reply> + Send;
}

/// Where the plugin endpoint listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// A unix domain socket path.
    Unix(PathBuf),
    /// A TCP `host:port`.
    Tcp(String),
}

impl ListenAddress {
    /// Parses `unix:///path/to.sock` or `tcp://host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: String| PluginError::InvalidListenUrl {
            url: raw.to_string(),
            reason,
        };
        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "unix" => {
                if url.path().is_empty() || url.path() == "/" {
                    return Err(invalid("missing socket path".to_string()));
                }
                Ok(Self::Unix(PathBuf::from(url.path())))
            }
            "tcp" | "http" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| invalid("missing host".to_string()))?;
                let port = url
                    .port()
                    .ok_or_else(|| invalid("missing port".to_string()))?;
                Ok(Self::Tcp(format!("{host}:{port}")))
            }
            other => Err(invalid(format!("unsupported scheme {other:?}"))),
        }
    }
}

enum Bound {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
    Tcp(TcpListener),
}

/// A bound plugin endpoint.
pub struct PluginListener {
    bound: Bound,
}

impl std::fmt::Debug for PluginListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginListener")
            .field("url", &self.local_url())
            .finish()
    }
}

impl PluginListener {
    /// Binds `address`. A leftover socket file is replaced.
    pub async fn bind(address: &ListenAddress) -> Result<Self> {
        let bound = match address {
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                if let Some(dir) = path.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(path = %path.display(), "removed stale socket"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Bound::Unix(tokio::net::UnixListener::bind(path)?, path.clone())
            }
            #[cfg(not(unix))]
            ListenAddress::Unix(path) => {
                return Err(PluginError::InvalidListenUrl {
                    url: path.display().to_string(),
                    reason: "unix sockets are not supported on this platform".to_string(),
                });
            }
            ListenAddress::Tcp(addr) => Bound::Tcp(TcpListener::bind(addr).await?),
        };
        let listener = Self { bound };
        info!(url = %listener.local_url(), "plugin endpoint listening");
        Ok(listener)
    }

    /// URL of the bound endpoint, with the actual port for TCP.
    pub fn local_url(&self) -> String {
        match &self.bound {
            #[cfg(unix)]
            Bound::Unix(_, path) => format!("unix://{}", path.display()),
            Bound::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{addr}"),
                Err(_) => "tcp://<unknown>".to_string(),
            },
        }
    }

    /// Serves calls until `shutdown` turns true, then removes the socket.
    pub async fn serve<H: PluginHandler>(
        self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.accept(&handler) => {
                    if let Err(e) = accepted {
                        error!(error = %e, "accept failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("plugin endpoint shutting down");
                        break;
                    }
                }
            }
        }

        #[cfg(unix)]
        if let Bound::Unix(_, path) = &self.bound {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove socket");
            }
        }
        Ok(())
    }

    async fn accept<H: PluginHandler>(&self, handler: &Arc<H>) -> std::io::Result<()> {
        match &self.bound {
            #[cfg(unix)]
            Bound::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                spawn_connection(stream, Arc::clone(handler));
            }
            Bound::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "accepted connection");
                spawn_connection(stream, Arc::clone(handler));
            }
        }
        Ok(())
    }
}

fn spawn_connection<S, H>(stream: S, handler: Arc<H>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: PluginHandler,
{
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let svc = service_fn(move |req| {
            let handler = Arc::clone(&handler);
            async move { dispatch(req, handler.as_ref()).await }
        });

        if let Err(e) = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(io, svc)
            .await
        {
            if !e.is_incomplete_message() {
                warn!(error = %e, "connection error");
            }
        }
    });
}

async fn dispatch<H: PluginHandler>(
    req: Request<Incoming>,
    handler: &H,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() != Method::POST {
        let mut response = Reply::NotFound.into_response();
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }
    let method = req.uri().path().to_string();
    let body = req.into_body().collect().await?.to_bytes();
    debug!(method = %method, bytes = body.len(), "plugin call");

    Ok(handler.handle(&method, body).await.into_response())
}
