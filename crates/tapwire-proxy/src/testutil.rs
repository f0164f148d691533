//! Local upstreams and proxy clients for end-to-end tests.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rcgen::{CertificateParams, KeyPair};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tapwire_storage::{Database, RecordKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::capture::{full, ProxyBody};

pub const ARTICLE_HTML: &str = "<html><head><title>Example</title></head>\
    <body><p>First paragraph of the story.</p><p>Second one.</p></body></html>";

/// Serves a few fixed routes:
///
/// - `/article`: an HTML page titled "Example"
/// - `/big?n=N`: `N` bytes of `a`
/// - `/echo`: the request body, with the tag header reflected as `x-seen-tag`
/// - `/stall`: headers and one chunk, then nothing
async fn upstream_service(req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let response = match path.as_str() {
        "/article" => Response::builder()
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(full(ARTICLE_HTML)),
        "/big" => {
            let n = query
                .strip_prefix("n=")
                .and_then(|n| n.parse().ok())
                .unwrap_or(1024);
            Response::builder()
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(full(vec![b'a'; n]))
        }
        "/echo" => {
            let seen = req
                .headers()
                .get("x-tapwire-agent")
                .cloned()
                .unwrap_or_else(|| hyper::header::HeaderValue::from_static("none"));
            let body = req
                .into_body()
                .collect()
                .await
                .map(|b| b.to_bytes())
                .unwrap_or_default();
            Response::builder()
                .header("x-seen-tag", seen)
                .body(full(body))
        }
        "/stall" => {
            let first = stream::iter(vec![Ok::<_, hyper::Error>(Frame::data(
                Bytes::from_static(b"<html><title>never finished"),
            ))]);
            let body = StreamBody::new(first.chain(stream::pending()));
            Response::builder()
                .header(CONTENT_TYPE, "text/html")
                .body(BodyExt::boxed(body))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("not found")),
    };

    Ok(response.unwrap())
}

/// Spawns a plain HTTP upstream on an ephemeral port.
pub async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream_service))
                    .await;
            });
        }
    });

    addr
}

/// A TLS upstream for `localhost` with a self-signed certificate.
pub struct TlsUpstream {
    pub addr: SocketAddr,
    pub cert: CertificateDer<'static>,
}

/// Spawns a TLS upstream on an ephemeral port.
pub async fn spawn_tls_upstream() -> TlsUpstream {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    let cert_der = cert.der().clone();

    let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert_der.clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(upstream_service))
                    .await;
            });
        }
    });

    TlsUpstream {
        addr,
        cert: cert_der,
    }
}

/// A keep-alive HTTP/1.1 client connection.
pub struct Client {
    sender: hyper::client::conn::http1::SendRequest<Full<Bytes>>,
}

/// A response read to the end.
pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Client {
    /// Opens a plain connection to the proxy.
    pub async fn connect(proxy: SocketAddr) -> Self {
        let stream = TcpStream::connect(proxy).await.unwrap();
        Self::over(stream).await
    }

    async fn over<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });
        Self { sender }
    }

    /// Sends a request; `uri` is absolute-form for plain proxying and
    /// origin-form inside a tunnel.
    pub async fn request(&mut self, method: Method, uri: &str, host: &str, body: &[u8]) -> Fetched {
        self.try_request(method, uri, host, body).await.unwrap()
    }

    pub async fn try_request(
        &mut self,
        method: Method,
        uri: &str,
        host: &str,
        body: &[u8],
    ) -> Result<Fetched, hyper::Error> {
        self.sender.ready().await?;

        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, host)
            .body(Full::new(Bytes::copy_from_slice(body)))
            .unwrap();

        let response = self.sender.send_request(req).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await?.to_bytes();

        Ok(Fetched {
            status,
            headers,
            body,
        })
    }

    pub async fn get(&mut self, url: &str) -> Fetched {
        let host = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default()
            .to_string();
        self.request(Method::GET, url, &host, b"").await
    }
}

/// Sends `CONNECT authority` and returns the stream and status code.
pub async fn connect_tunnel(proxy: SocketAddr, authority: &str) -> (TcpStream, u16) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "proxy closed during CONNECT");
        head.push(byte[0]);
    }

    let status = String::from_utf8_lossy(&head)
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);

    (stream, status)
}

/// Opens a TLS session through the proxy trusting only `root`.
pub async fn tls_through_proxy(
    proxy: SocketAddr,
    authority: &str,
    root: &CertificateDer<'static>,
) -> std::io::Result<Client> {
    let (stream, status) = connect_tunnel(proxy, authority).await;
    assert_eq!(status, 200);

    let mut roots = RootCertStore::empty();
    roots.add(root.clone()).unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let tls = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await?;

    Ok(Client::over(tls).await)
}

/// Polls until `kind` reaches `expected` rows or a few seconds pass.
pub async fn wait_for_count(db: &Database, kind: RecordKind, expected: i64) -> i64 {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let count = db.count(kind).unwrap();
        if count >= expected || tokio::time::Instant::now() >= deadline {
            return count;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
