//! Per-connection handling.
//!
//! Each accepted client connection is served by one task that walks the
//! [`ConnectionPhase`] state machine for every request it reads. Captured
//! exchanges are handed to a recorder task owned by the connection, which
//! persists them in order once the response body has finished.

use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, HOST, VIA,
};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioIo, TokioTimer};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use rustls::ServerConfig;
use tapwire_storage::{Database, Direction, HeaderList, NewTraffic};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ca::CertificateAuthority;
use crate::capture::{empty, full, CaptureBody, Captured, ProxyBody};
use crate::domains::TargetDomains;
use crate::error::{CertificateError, ProxyError};
use crate::extractor::{extract_article, Extraction};
use crate::io::IdleTimeout;
use crate::metrics::{ActiveConnection, ProxyMetrics};
use crate::upstream::{Origin, UpstreamConnector};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Waiting for the next request head.
    AwaitingRequest,
    /// Forwarding a target request through capture taps.
    Intercepting,
    /// Forwarding a non-target request untouched.
    Passthrough,
    /// Relaying raw bytes after `CONNECT`.
    Tunnel,
    /// Terminating TLS for a target host after `CONNECT`.
    TlsIntercept,
    /// Connection finished.
    Closed,
}

/// Picks the phase a request moves the connection into.
pub fn route(method: &Method, host: &str, targets: &TargetDomains) -> ConnectionPhase {
    match (method == Method::CONNECT, targets.matches(host)) {
        (true, true) => ConnectionPhase::TlsIntercept,
        (true, false) => ConnectionPhase::Tunnel,
        (false, true) => ConnectionPhase::Intercepting,
        (false, false) => ConnectionPhase::Passthrough,
    }
}

/// Name this proxy uses in `Via` headers.
const VIA_PSEUDONYM: &str = "tapwire";

/// Settings every connection reads.
#[derive(Debug, Clone)]
pub(crate) struct CaptureSettings {
    pub max_body_capture: usize,
    pub idle_timeout: Duration,
    pub header_read_timeout: Duration,
    pub tag_header: Option<(HeaderName, HeaderValue)>,
}

/// State shared by all connections of one running server.
pub(crate) struct Shared {
    pub listen: SocketAddr,
    pub authority: Option<Arc<CertificateAuthority>>,
    pub upstream: UpstreamConnector,
    pub db: Database,
    pub metrics: ProxyMetrics,
    pub settings: CaptureSettings,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

/// Serves one accepted client connection until it closes or shutdown.
pub(crate) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    targets: Arc<TargetDomains>,
) {
    let active = shared.metrics.connection_opened();
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr().unwrap_or(shared.listen);

    let (recorder, records) = mpsc::unbounded_channel();
    let conn = Arc::new(ClientConnection {
        id: Uuid::new_v4().to_string(),
        shared: Arc::clone(&shared),
        targets,
        local,
        next_sequence: AtomicI64::new(1),
        phase: Mutex::new(ConnectionPhase::AwaitingRequest),
        recorder,
        _active: active,
    });

    shared
        .tracker
        .spawn(run_recorder(conn.id.clone(), records, Arc::clone(&shared)));

    debug!(connection = %conn.id, %peer, "Accepted connection");

    let io = TokioIo::new(IdleTimeout::new(stream, shared.settings.idle_timeout));
    let service_conn = Arc::clone(&conn);
    let service = service_fn(move |req| handle(Arc::clone(&service_conn), None, req));

    let served = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(shared.settings.header_read_timeout)
        .preserve_header_case(true)
        .serve_connection(io, service)
        .with_upgrades();

    tokio::select! {
        result = served => {
            if let Err(e) = result {
                debug!(connection = %conn.id, "Connection closed: {}", e);
            }
        }
        _ = shared.shutdown.cancelled() => {}
    }
}

/// Work handed from the request path to the recorder.
enum Recording {
    /// A forwarded exchange; persisted once the response body is done.
    Exchange {
        sequence: i64,
        request: MessageHead,
        request_body: oneshot::Receiver<Captured>,
        response: MessageHead,
        response_body: oneshot::Receiver<Captured>,
    },
    /// Upstream failed; the client got a synthetic 502.
    UpstreamFailed {
        sequence: i64,
        request: MessageHead,
        request_body: oneshot::Receiver<Captured>,
        note: String,
    },
    /// A single standalone record, e.g. a skipped TLS interception.
    Note(NewTraffic),
}

/// Metadata captured before a body starts streaming.
struct MessageHead {
    method: String,
    url: String,
    status_code: Option<u16>,
    headers: HeaderList,
}

/// One accepted client connection.
///
/// Tunnel and TLS tasks hold it too, so it lives until the last of them ends.
struct ClientConnection {
    id: String,
    shared: Arc<Shared>,
    targets: Arc<TargetDomains>,
    /// Address the client reached us on.
    local: SocketAddr,
    next_sequence: AtomicI64,
    phase: Mutex<ConnectionPhase>,
    recorder: mpsc::UnboundedSender<Recording>,
    _active: ActiveConnection,
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        let last = std::mem::replace(self.phase.get_mut(), ConnectionPhase::Closed);
        debug!(
            connection = %self.id,
            last_phase = ?last,
            exchanges = self.next_sequence.load(Ordering::Relaxed) - 1,
            "Connection closed"
        );
    }
}

impl ClientConnection {
    fn enter(&self, next: ConnectionPhase) {
        let mut phase = self.phase.lock();
        if *phase != next {
            trace!(connection = %self.id, from = ?*phase, to = ?next, "Phase change");
            *phase = next;
        }
    }

    /// Whether forwarding to `origin` would bring the request back here.
    ///
    /// Catches direct self-addressing. Indirect loops, e.g. through a DNS
    /// name for this host, are stopped on the second pass by [`carries_via`].
    fn is_self_addressed(&self, origin: &Origin) -> bool {
        let listen = self.shared.listen;
        if origin.port != listen.port() {
            return false;
        }
        if origin.host.eq_ignore_ascii_case("localhost") {
            return true;
        }

        match origin.host.parse::<IpAddr>() {
            Ok(ip) => {
                ip.is_loopback() || ip.is_unspecified() || ip == listen.ip() || ip == self.local.ip()
            }
            Err(_) => false,
        }
    }

    fn next_sequence(&self) -> i64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, recording: Recording) {
        if self.recorder.send(recording).is_err() {
            debug!(connection = %self.id, "Recorder gone, record dropped");
            self.shared.metrics.record_dropped();
        }
    }

    fn max_capture(&self) -> usize {
        self.shared.settings.max_body_capture
    }

    /// Forwards a target request with both bodies tapped.
    async fn intercept(&self, origin: Origin, req: Request<Incoming>) -> Response<ProxyBody> {
        self.enter(ConnectionPhase::Intercepting);
        let sequence = self.next_sequence();

        let (mut parts, body) = req.into_parts();
        let url = origin.url(path_and_query(&parts.uri));
        prepare_upstream_request(&mut parts, &origin, self.shared.settings.tag_header.as_ref());

        let request = MessageHead {
            method: parts.method.to_string(),
            url,
            status_code: None,
            headers: header_list(&parts.headers),
        };

        let (body, request_body) = CaptureBody::new(body.boxed(), self.max_capture());
        let upstream_request = Request::from_parts(parts, body.boxed());

        match self.shared.upstream.send(&origin, upstream_request).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let head = MessageHead {
                    method: request.method.clone(),
                    url: request.url.clone(),
                    status_code: Some(parts.status.as_u16()),
                    headers: header_list(&parts.headers),
                };

                let (body, response_body) = CaptureBody::new(body.boxed(), self.max_capture());
                self.record(Recording::Exchange {
                    sequence,
                    request,
                    request_body,
                    response: head,
                    response_body,
                });

                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                debug!(connection = %self.id, url = %request.url, "Upstream failed: {}", e);
                self.record(Recording::UpstreamFailed {
                    sequence,
                    request,
                    request_body,
                    note: format!("upstream error: {e}"),
                });
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Forwards a non-target request without capture.
    async fn pass_through(&self, origin: Origin, req: Request<Incoming>) -> Response<ProxyBody> {
        self.enter(ConnectionPhase::Passthrough);

        let (mut parts, body) = req.into_parts();
        prepare_upstream_request(&mut parts, &origin, None);

        match self
            .shared
            .upstream
            .send(&origin, Request::from_parts(parts, body.boxed()))
            .await
        {
            Ok(response) => response.map(|body| body.boxed()),
            Err(e) => {
                debug!(connection = %self.id, %origin, "Passthrough upstream failed: {}", e);
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Answers `CONNECT` and hands the upgraded stream to a tunnel or TLS task.
    async fn connect(self: &Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().cloned() else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        let origin = Origin::new(true, authority.host(), authority.port_u16().unwrap_or(443));
        if self.is_self_addressed(&origin) {
            warn!(connection = %self.id, %origin, "Refusing CONNECT to the proxy itself");
            return status_response(StatusCode::LOOP_DETECTED);
        }

        match route(req.method(), &origin.host, &self.targets) {
            ConnectionPhase::TlsIntercept => {}
            _ => return self.open_tunnel(req, origin).await,
        }

        let server_config = match &self.shared.authority {
            Some(ca) => ca.server_config(&origin.host),
            None => Err(CertificateError::CaUnavailable),
        };

        match server_config {
            Ok(config) => {
                self.enter(ConnectionPhase::TlsIntercept);
                self.spawn_tls_intercept(req, origin, config);
                status_response(StatusCode::OK)
            }
            Err(e) => {
                info!(
                    connection = %self.id,
                    host = %origin.host,
                    "TLS interception skipped: {}", e
                );
                self.shared.metrics.tls_degraded();
                self.record(Recording::Note(NewTraffic {
                    connection_id: self.id.clone(),
                    sequence: self.next_sequence(),
                    direction: Direction::Request,
                    method: Method::CONNECT.to_string(),
                    url: origin.url(""),
                    status_code: None,
                    headers: header_list(req.headers()),
                    body: Vec::new(),
                    truncated: true,
                    note: Some(format!("tls interception skipped: {e}")),
                }));
                self.open_tunnel(req, origin).await
            }
        }
    }

    /// Relays raw bytes between the client and `origin`.
    async fn open_tunnel(self: &Arc<Self>, req: Request<Incoming>, origin: Origin) -> Response<ProxyBody> {
        self.enter(ConnectionPhase::Tunnel);

        let connecting = self.shared.upstream.connect_tcp(&origin.host, origin.port);
        let mut upstream = match connecting.await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(connection = %self.id, %origin, "Tunnel connect failed: {}", e);
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let conn = Arc::clone(self);
        let shutdown = self.shared.shutdown.clone();
        self.shared.tracker.spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!(connection = %conn.id, "Upgrade failed: {}", e);
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);

            tokio::select! {
                result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => match result {
                    Ok((up, down)) => trace!(connection = %conn.id, up, down, "Tunnel closed"),
                    Err(e) => debug!(connection = %conn.id, "Tunnel closed: {}", e),
                },
                _ = shutdown.cancelled() => {}
            }
        });

        status_response(StatusCode::OK)
    }

    fn spawn_tls_intercept(
        self: &Arc<Self>,
        req: Request<Incoming>,
        origin: Origin,
        config: Arc<ServerConfig>,
    ) {
        let conn = Arc::clone(self);
        let shutdown = self.shared.shutdown.clone();

        self.shared.tracker.spawn(async move {
            tokio::select! {
                _ = conn.serve_tls(req, origin, config) => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Terminates the client's TLS session and serves the requests inside it.
    async fn serve_tls(
        self: Arc<Self>,
        req: Request<Incoming>,
        origin: Origin,
        config: Arc<ServerConfig>,
    ) {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(connection = %self.id, "Upgrade failed: {}", e);
                return;
            }
        };

        let tls = match TlsAcceptor::from(config).accept(TokioIo::new(upgraded)).await {
            Ok(tls) => tls,
            Err(e) => {
                if is_certificate_rejection(&e) {
                    if let Some(ca) = &self.shared.authority {
                        ca.mark_untrusted(&origin.host);
                    }
                }
                debug!(
                    connection = %self.id,
                    host = %origin.host,
                    "Client TLS handshake failed: {}", e
                );
                return;
            }
        };

        let origin = Arc::new(origin);
        let conn = Arc::clone(&self);
        let service =
            service_fn(move |req| handle(Arc::clone(&conn), Some(Arc::clone(&origin)), req));

        let result = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.shared.settings.header_read_timeout)
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(tls), service)
            .await;

        if let Err(e) = result {
            debug!(connection = %self.id, "TLS session closed: {}", e);
        }
    }
}

/// Entry point for every request read from a client.
///
/// `tunnel` is set for requests arriving inside an intercepted TLS session.
async fn handle(
    conn: Arc<ClientConnection>,
    tunnel: Option<Arc<Origin>>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        if tunnel.is_some() {
            return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
        }
        return Ok(conn.connect(req).await);
    }

    if carries_via(req.headers()) {
        warn!(connection = %conn.id, uri = %req.uri(), "Request already passed through this proxy");
        return Ok(status_response(StatusCode::LOOP_DETECTED));
    }

    let origin = match tunnel {
        Some(origin) => origin.as_ref().clone(),
        None => match origin_from_request(&req) {
            Ok(origin) if conn.is_self_addressed(&origin) => {
                warn!(connection = %conn.id, %origin, "Refusing request addressed to the proxy itself");
                return Ok(status_response(StatusCode::LOOP_DETECTED));
            }
            Ok(origin) => origin,
            Err(e) => {
                debug!(connection = %conn.id, "Rejected request: {}", e);
                return Ok(status_response(StatusCode::BAD_REQUEST));
            }
        },
    };

    let response = match route(req.method(), &origin.host, &conn.targets) {
        ConnectionPhase::Intercepting => conn.intercept(origin, req).await,
        _ => conn.pass_through(origin, req).await,
    };

    conn.enter(ConnectionPhase::AwaitingRequest);
    Ok(response)
}

/// Persists a connection's exchanges in the order they were handed over.
async fn run_recorder(
    connection_id: String,
    mut records: mpsc::UnboundedReceiver<Recording>,
    shared: Arc<Shared>,
) {
    // Bounds how long a finished response waits for its request body.
    let request_wait = shared.settings.idle_timeout;

    while let Some(recording) = records.recv().await {
        match recording {
            Recording::Exchange {
                sequence,
                request,
                request_body,
                response,
                response_body,
            } => {
                let response_body = response_body.await.unwrap_or_default();
                if !response_body.complete {
                    debug!(
                        connection = %connection_id,
                        sequence,
                        "Response did not complete; exchange not recorded"
                    );
                    continue;
                }
                let request_body = tokio::time::timeout(request_wait, request_body)
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default();

                let is_html = header_value(&response.headers, CONTENT_TYPE.as_str())
                    .is_some_and(|v| v.to_ascii_lowercase().contains("text/html"));
                let encoding =
                    header_value(&response.headers, CONTENT_ENCODING.as_str()).map(str::to_string);
                let url = response.url.clone();

                let request = traffic(
                    &connection_id,
                    sequence,
                    Direction::Request,
                    request,
                    &request_body,
                    None,
                );
                let response = traffic(
                    &connection_id,
                    sequence,
                    Direction::Response,
                    response,
                    &response_body,
                    None,
                );

                if !persist_exchange(&shared, request, response).await {
                    continue;
                }

                if is_html {
                    extract_and_store(&shared, url, encoding, response_body.bytes).await;
                }
            }
            Recording::UpstreamFailed {
                sequence,
                request,
                request_body,
                note,
            } => {
                let request_body = tokio::time::timeout(request_wait, request_body)
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default();

                let response = MessageHead {
                    method: request.method.clone(),
                    url: request.url.clone(),
                    status_code: Some(StatusCode::BAD_GATEWAY.as_u16()),
                    headers: Vec::new(),
                };
                let complete = Captured {
                    complete: true,
                    ..Captured::default()
                };

                let request = traffic(
                    &connection_id,
                    sequence,
                    Direction::Request,
                    request,
                    &request_body,
                    None,
                );
                let response = traffic(
                    &connection_id,
                    sequence,
                    Direction::Response,
                    response,
                    &complete,
                    Some(note),
                );

                persist_exchange(&shared, request, response).await;
            }
            Recording::Note(record) => {
                let db = shared.db.clone();
                match tokio::task::spawn_blocking(move || db.append_traffic(&record)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) => shared.metrics.record_dropped(),
                    Err(e) => {
                        warn!("Store task failed: {}", e);
                        shared.metrics.record_dropped();
                    }
                }
            }
        }
    }

    trace!(connection = %connection_id, "Recorder finished");
}

fn traffic(
    connection_id: &str,
    sequence: i64,
    direction: Direction,
    head: MessageHead,
    body: &Captured,
    note: Option<String>,
) -> NewTraffic {
    NewTraffic {
        connection_id: connection_id.to_string(),
        sequence,
        direction,
        method: head.method,
        url: head.url,
        status_code: head.status_code,
        headers: head.headers,
        body: body.bytes.clone(),
        truncated: body.truncated(),
        note,
    }
}

/// Writes both halves in one transaction. Returns whether it stuck.
async fn persist_exchange(shared: &Shared, request: NewTraffic, response: NewTraffic) -> bool {
    let db = shared.db.clone();
    match tokio::task::spawn_blocking(move || db.append_exchange(&request, &response)).await {
        Ok(Ok(_)) => {
            shared.metrics.exchange_recorded();
            true
        }
        // The store already logged the drop.
        Ok(Err(_)) => {
            shared.metrics.record_dropped();
            false
        }
        Err(e) => {
            warn!("Store task failed: {}", e);
            shared.metrics.record_dropped();
            false
        }
    }
}

async fn extract_and_store(shared: &Shared, url: String, encoding: Option<String>, body: Vec<u8>) {
    let db = shared.db.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        match extract_article(&url, encoding.as_deref(), &body) {
            Extraction::Article(article) => Ok(Some(db.append_article_if_absent(&article))),
            Extraction::NoArticle => Ok(None),
            Extraction::Failed(reason) => Err(reason),
        }
    })
    .await;

    match outcome {
        Ok(Ok(Some(Ok(inserted)))) => {
            if inserted.is_new() {
                shared.metrics.article_extracted();
            }
        }
        Ok(Ok(Some(Err(_)))) => shared.metrics.record_dropped(),
        Ok(Ok(None)) => {}
        Ok(Err(reason)) => {
            trace!("Extraction failed: {}", reason);
            shared.metrics.extraction_failed();
        }
        Err(e) => {
            warn!("Extraction task failed: {}", e);
            shared.metrics.extraction_failed();
        }
    }
}

/// Resolves where a plain proxy request goes: absolute-form URI, else `Host`.
fn origin_from_request<B>(req: &Request<B>) -> Result<Origin, ProxyError> {
    let uri = req.uri();
    let https = uri.scheme_str() == Some("https");

    let authority = match uri.authority() {
        Some(authority) => authority.clone(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse().ok())
            .ok_or_else(|| ProxyError::BadRequest("request has no host".into()))?,
    };

    let default_port = if https { 443 } else { 80 };
    Ok(Origin::new(
        https,
        authority.host(),
        authority.port_u16().unwrap_or(default_port),
    ))
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// Rewrites a proxy request into what the origin server expects.
fn prepare_upstream_request(
    parts: &mut Parts,
    origin: &Origin,
    tag: Option<&(HeaderName, HeaderValue)>,
) {
    let origin_form = path_and_query(&parts.uri).to_string();
    parts.uri = origin_form.parse().unwrap_or_else(|_| Uri::from_static("/"));

    parts.headers.remove("proxy-connection");
    parts.headers.remove(hyper::header::PROXY_AUTHORIZATION);

    if !parts.headers.contains_key(HOST) {
        if let Ok(host) = HeaderValue::from_str(&origin.authority()) {
            parts.headers.insert(HOST, host);
        }
    }

    let via = format!("{} {VIA_PSEUDONYM}", version_token(parts.version));
    if let Ok(via) = HeaderValue::from_str(&via) {
        parts.headers.append(VIA, via);
    }

    if let Some((name, value)) = tag {
        parts.headers.insert(name.clone(), value.clone());
    }
}

/// Protocol version as written in `Via`.
fn version_token(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

/// Whether any `Via` entry names this proxy.
fn carries_via(headers: &HeaderMap) -> bool {
    headers
        .get_all(VIA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|entry| entry.split_whitespace().nth(1))
        .any(|by| by.eq_ignore_ascii_case(VIA_PSEUDONYM))
}

fn header_list(headers: &HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn header_value<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let body = if status.is_success() {
        empty()
    } else {
        full(status.canonical_reason().unwrap_or("Error"))
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Whether a handshake failed because the client refused our certificate.
fn is_certificate_rejection(err: &io::Error) -> bool {
    use rustls::AlertDescription::{
        BadCertificate, CertificateExpired, CertificateRevoked, CertificateUnknown, UnknownCA,
        UnsupportedCertificate,
    };

    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|e| {
            matches!(
                e,
                rustls::Error::AlertReceived(
                    BadCertificate
                        | CertificateExpired
                        | CertificateRevoked
                        | CertificateUnknown
                        | UnknownCA
                        | UnsupportedCertificate
                )
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_by_method_and_target() {
        let targets = TargetDomains::new(["dawn.com"]);

        assert_eq!(
            route(&Method::GET, "www.dawn.com", &targets),
            ConnectionPhase::Intercepting
        );
        assert_eq!(
            route(&Method::POST, "example.com", &targets),
            ConnectionPhase::Passthrough
        );
        assert_eq!(
            route(&Method::CONNECT, "dawn.com", &targets),
            ConnectionPhase::TlsIntercept
        );
        assert_eq!(
            route(&Method::CONNECT, "example.com", &targets),
            ConnectionPhase::Tunnel
        );
    }

    #[test]
    fn origin_from_absolute_form() {
        let req = Request::get("http://www.dawn.com:8080/news?id=1")
            .body(())
            .unwrap();
        let origin = origin_from_request(&req).unwrap();

        assert_eq!(origin, Origin::new(false, "www.dawn.com", 8080));
        assert_eq!(origin.url(path_and_query(req.uri())), "http://www.dawn.com:8080/news?id=1");
    }

    #[test]
    fn origin_falls_back_to_host_header() {
        let req = Request::get("/index.html")
            .header(HOST, "dawn.com")
            .body(())
            .unwrap();
        assert_eq!(origin_from_request(&req).unwrap(), Origin::new(false, "dawn.com", 80));

        let bare = Request::get("/").body(()).unwrap();
        assert!(origin_from_request(&bare).is_err());
    }

    #[test]
    fn upstream_request_is_origin_form_and_tagged() {
        let req = Request::get("http://dawn.com/a?b=c")
            .header("proxy-connection", "keep-alive")
            .header("proxy-authorization", "Basic eA==")
            .header("accept", "text/html")
            .body(())
            .unwrap();
        let origin = origin_from_request(&req).unwrap();
        let (mut parts, _) = req.into_parts();

        let tag = (
            HeaderName::from_static("x-tapwire-agent"),
            HeaderValue::from_static("tapwire"),
        );
        prepare_upstream_request(&mut parts, &origin, Some(&tag));

        assert_eq!(parts.uri, "/a?b=c");
        assert!(parts.headers.get("proxy-connection").is_none());
        assert!(parts.headers.get("proxy-authorization").is_none());
        assert_eq!(parts.headers[HOST], "dawn.com");
        assert_eq!(parts.headers["x-tapwire-agent"], "tapwire");
        assert_eq!(parts.headers["accept"], "text/html");
        assert_eq!(parts.headers[VIA], "1.1 tapwire");
        assert!(carries_via(&parts.headers));
    }

    #[test]
    fn via_keeps_earlier_hops() {
        let req = Request::get("http://dawn.com/")
            .header(VIA, "1.0 corp-gateway")
            .body(())
            .unwrap();
        assert!(!carries_via(req.headers()));

        let origin = origin_from_request(&req).unwrap();
        let (mut parts, _) = req.into_parts();
        prepare_upstream_request(&mut parts, &origin, None);

        let hops: Vec<_> = parts.headers.get_all(VIA).iter().collect();
        assert_eq!(hops, ["1.0 corp-gateway", "1.1 tapwire"]);
    }

    #[test]
    fn via_is_matched_per_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(VIA, HeaderValue::from_static("1.1 edge (cache), 1.1 TAPWIRE"));
        assert!(carries_via(&headers));

        headers.insert(VIA, HeaderValue::from_static("1.1 tapwire-like, 2 other"));
        assert!(!carries_via(&headers));
    }

    #[test]
    fn header_list_keeps_duplicates_in_order() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));

        let list = header_list(&headers);
        let cookies: Vec<_> = list
            .iter()
            .filter(|(n, _)| n == "set-cookie")
            .map(|(_, v)| v.as_str())
            .collect();

        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(header_value(&list, "Content-Type"), Some("text/html"));
    }

    #[test]
    fn certificate_rejection_is_recognized() {
        let rejected = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::UnknownCA),
        );
        let other = io::Error::new(io::ErrorKind::ConnectionReset, "reset");

        assert!(is_certificate_rejection(&rejected));
        assert!(!is_certificate_rejection(&other));
    }
}
