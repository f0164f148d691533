//! Upstream connections.
//!
//! Every forwarded request gets its own connection. The client connection
//! already serializes requests, so pooling would only save handshakes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::capture::ProxyBody;
use crate::error::{ProxyError, Result};
use crate::io::IdleTimeout;

/// Where a request is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub https: bool,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(https: bool, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);

        Self { https, host, port }
    }

    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    fn default_port(&self) -> u16 {
        if self.https {
            443
        } else {
            80
        }
    }

    /// `host[:port]`, omitting the scheme's default port.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        if self.port == self.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Absolute URL for a request path.
    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}://{}{}", self.scheme(), self.authority(), path_and_query)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

/// Opens plain and TLS connections to upstream servers.
pub struct UpstreamConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl UpstreamConnector {
    /// Trusts the bundled web roots plus `extra_roots`.
    pub fn new(
        extra_roots: &[CertificateDer<'static>],
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for root in extra_roots {
            roots.add(root.clone())?;
        }

        let mut config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout,
            idle_timeout,
        })
    }

    /// Opens a TCP connection wrapped in the idle timeout.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<IdleTimeout<TcpStream>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::Upstream(format!("connect to {host}:{port} timed out")))?
            .map_err(|e| ProxyError::Upstream(format!("connect to {host}:{port}: {e}")))?;
        let _ = stream.set_nodelay(true);

        Ok(IdleTimeout::new(stream, self.idle_timeout))
    }

    /// Sends `request` (origin-form URI) to `origin` on a fresh connection.
    pub async fn send(
        &self,
        origin: &Origin,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>> {
        let stream = self.connect_tcp(&origin.host, origin.port).await?;

        if origin.https {
            let name = ServerName::try_from(origin.host.clone())
                .map_err(|e| ProxyError::Upstream(format!("invalid server name: {e}")))?;
            let tls = self
                .tls
                .connect(name, stream)
                .await
                .map_err(|e| ProxyError::Upstream(format!("TLS to {origin}: {e}")))?;
            send_over(TokioIo::new(tls), request).await
        } else {
            send_over(TokioIo::new(stream), request).await
        }
    }
}

async fn send_over<T>(io: T, request: Request<ProxyBody>) -> Result<Response<Incoming>>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(io)
        .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection closed: {}", e);
        }
    });

    Ok(sender.send_request(request).await?)
}
