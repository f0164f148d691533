//! Intercepting proxy server.
//!
//! Provides the server that accepts client connections and hands each one to
//! its own task.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{HeaderName, HeaderValue};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::CertificateDer;
use tapwire_storage::Database;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::ca::{CaManager, CertificateAuthority};
use crate::capture::DEFAULT_MAX_BODY_CAPTURE;
use crate::connection::{self, CaptureSettings, Shared};
use crate::domains::TargetDomains;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::upstream::UpstreamConnector;
use crate::DEFAULT_PROXY_PORT;

/// Default header added to intercepted requests.
pub const DEFAULT_TAG_HEADER: (&str, &str) = ("x-tapwire-agent", "tapwire");

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation; `None` disables TLS interception.
    pub ca_manager: Option<CaManager>,
    /// Hosts whose traffic is captured.
    pub target_domains: TargetDomains,
    /// Bytes kept per captured body.
    pub max_body_capture: usize,
    /// A stream with no progress for this long is closed.
    pub idle_timeout: Duration,
    /// Time allowed for a client to send a complete request head.
    pub header_read_timeout: Duration,
    /// Time allowed to open an upstream connection.
    pub connect_timeout: Duration,
    /// Header added to intercepted requests.
    pub tag_header: Option<(String, String)>,
    /// Extra roots trusted for upstream TLS, on top of the bundled web roots.
    pub upstream_roots: Vec<CertificateDer<'static>>,
}

impl ProxyConfig {
    /// Creates a new configuration with default settings.
    ///
    /// The CA lives in the default data directory when one can be determined.
    pub fn new() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager: CaManager::with_default_dir().ok(),
            target_domains: TargetDomains::defaults(),
            max_body_capture: DEFAULT_MAX_BODY_CAPTURE,
            idle_timeout: Duration::from_secs(30),
            header_read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            tag_header: Some((
                DEFAULT_TAG_HEADER.0.to_string(),
                DEFAULT_TAG_HEADER.1.to_string(),
            )),
            upstream_roots: Vec::new(),
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = Some(ca_manager);
        self
    }

    /// Disables TLS interception; target `CONNECT`s are relayed.
    pub fn without_ca(mut self) -> Self {
        self.ca_manager = None;
        self
    }

    /// Sets the captured hosts.
    pub fn with_target_domains(mut self, target_domains: TargetDomains) -> Self {
        self.target_domains = target_domains;
        self
    }

    /// Sets the per-body capture bound.
    pub fn with_max_body_capture(mut self, bytes: usize) -> Self {
        self.max_body_capture = bytes;
        self
    }

    /// Sets the idle timeout for client and upstream streams.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the request head timeout.
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    /// Sets the upstream connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the tag header, or `None` to send requests untagged.
    pub fn with_tag_header(mut self, tag: Option<(String, String)>) -> Self {
        self.tag_header = tag;
        self
    }

    /// Trusts an extra root for upstream TLS.
    pub fn with_upstream_root(mut self, root: CertificateDer<'static>) -> Self {
        self.upstream_roots.push(root);
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Intercepting proxy server.
pub struct ProxyServer {
    addr: Mutex<SocketAddr>,
    targets: Arc<RwLock<Arc<TargetDomains>>>,
    ca_cert_path: Option<PathBuf>,
    authority: Option<Arc<CertificateAuthority>>,
    upstream: Arc<UpstreamSettings>,
    db: Database,
    metrics: ProxyMetrics,
    settings: CaptureSettings,
}

/// Inputs for building an [`UpstreamConnector`] on each start.
struct UpstreamSettings {
    roots: Vec<CertificateDer<'static>>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl ProxyServer {
    /// Creates a new proxy server writing to `db`.
    ///
    /// A CA that cannot be created or loaded disables TLS interception
    /// instead of failing.
    pub fn new(config: ProxyConfig, db: Database) -> Result<Self> {
        let authority = match &config.ca_manager {
            Some(manager) => match manager.ensure_ca() {
                Ok(authority) => Some(Arc::new(authority)),
                Err(e) => {
                    warn!("CA unavailable, TLS interception disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        let tag_header = config
            .tag_header
            .as_ref()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| ProxyError::Proxy(format!("invalid tag header name: {e}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| ProxyError::Proxy(format!("invalid tag header value: {e}")))?;
                Ok::<_, ProxyError>((name, value))
            })
            .transpose()?;

        let upstream = UpstreamSettings {
            roots: config.upstream_roots,
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
        };
        // Surface bad roots now rather than on start.
        UpstreamConnector::new(&upstream.roots, upstream.connect_timeout, upstream.idle_timeout)?;

        Ok(Self {
            addr: Mutex::new(config.addr),
            targets: Arc::new(RwLock::new(Arc::new(config.target_domains))),
            ca_cert_path: config.ca_manager.as_ref().map(CaManager::cert_path),
            authority,
            upstream: Arc::new(upstream),
            db,
            metrics: ProxyMetrics::new(),
            settings: CaptureSettings {
                max_body_capture: config.max_body_capture,
                idle_timeout: config.idle_timeout,
                header_read_timeout: config.header_read_timeout,
                tag_header,
            },
        })
    }

    /// Replaces the target domains and the listen address.
    ///
    /// New targets apply to connections accepted from now on. The address is
    /// used the next time the server is started.
    pub fn configure(&self, target_domains: TargetDomains, addr: SocketAddr) {
        self.set_target_domains(target_domains);
        *self.addr.lock() = addr;
    }

    /// Replaces the target domains for new connections.
    pub fn set_target_domains(&self, target_domains: TargetDomains) {
        info!(domains = target_domains.len(), "Target domains updated");
        *self.targets.write() = Arc::new(target_domains);
    }

    /// The current target domain snapshot.
    pub fn target_domains(&self) -> Arc<TargetDomains> {
        Arc::clone(&self.targets.read())
    }

    /// Returns the address the proxy will listen on at the next start.
    pub fn addr(&self) -> SocketAddr {
        *self.addr.lock()
    }

    /// Returns the CA certificate path for installing on devices.
    pub fn ca_cert_path(&self) -> Option<PathBuf> {
        self.ca_cert_path.clone()
    }

    /// Whether TLS interception is available.
    pub fn intercepts_tls(&self) -> bool {
        self.authority.is_some()
    }

    /// Operational counters.
    pub fn metrics(&self) -> ProxyMetrics {
        self.metrics.clone()
    }

    /// Starts the proxy server and blocks until it stops.
    pub async fn run(&self) -> Result<()> {
        let handle = self.start().await?;
        handle.wait().await;
        Ok(())
    }

    /// Binds the listen address and serves in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub async fn start(&self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.addr())
            .await
            .map_err(|e| ProxyError::Proxy(format!("bind {}: {e}", self.addr())))?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let shared = Arc::new(Shared {
            listen: addr,
            authority: self.authority.clone(),
            upstream: UpstreamConnector::new(
                &self.upstream.roots,
                self.upstream.connect_timeout,
                self.upstream.idle_timeout,
            )?,
            db: self.db.clone(),
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        });

        info!("Starting proxy on {}", addr);
        if let Some(path) = &self.ca_cert_path {
            info!("CA certificate: {:?}", path);
        }

        let targets = Arc::clone(&self.targets);
        let handle = tokio::spawn(accept_loop(listener, shared, targets));

        Ok(ProxyHandle {
            shutdown,
            addr,
            handle,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    targets: Arc<RwLock<Arc<TargetDomains>>>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    // Connections keep the snapshot they were accepted under.
                    let snapshot = Arc::clone(&targets.read());
                    shared
                        .tracker
                        .spawn(connection::serve(stream, peer, Arc::clone(&shared), snapshot));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    drop(listener);
    shared.tracker.close();
    shared.tracker.wait().await;
    info!("Proxy server stopped");
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown: CancellationToken,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the proxy and its connections to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        connect_tunnel, spawn_tls_upstream, spawn_upstream, tls_through_proxy, wait_for_count,
        Client, ARTICLE_HTML,
    };
    use hyper::{Method, StatusCode};
    use tapwire_storage::{Direction, RecordKind};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Harness {
        _ca_dir: TempDir,
        ca_manager: CaManager,
        db: Database,
    }

    impl Harness {
        fn new() -> Self {
            let ca_dir = TempDir::new().unwrap();
            let ca_manager = CaManager::new(ca_dir.path().join("ca"));
            Self {
                _ca_dir: ca_dir,
                ca_manager,
                db: Database::in_memory().unwrap(),
            }
        }

        fn config(&self, targets: &[&str]) -> ProxyConfig {
            ProxyConfig::new()
                .with_port(0)
                .with_ca_manager(self.ca_manager.clone())
                .with_target_domains(TargetDomains::new(targets))
        }

        async fn start(&self, config: ProxyConfig) -> (ProxyServer, ProxyHandle) {
            let server = ProxyServer::new(config, self.db.clone()).unwrap();
            let handle = server.start().await.unwrap();
            (server, handle)
        }

        fn ca_cert(&self) -> CertificateDer<'static> {
            CertificateDer::from(self.ca_manager.read_cert_der().unwrap())
        }
    }

    #[test]
    fn proxy_config_builders() {
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = ProxyConfig::new()
            .with_addr(addr)
            .with_max_body_capture(10)
            .with_idle_timeout(Duration::from_secs(1))
            .with_tag_header(None)
            .without_ca();

        assert_eq!(config.addr, addr);
        assert_eq!(config.max_body_capture, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(1));
        assert!(config.tag_header.is_none());
        assert!(config.ca_manager.is_none());
        assert_eq!(ProxyConfig::new().with_port(8888).addr.port(), 8888);
    }

    #[test]
    fn invalid_tag_header_is_rejected() {
        let config = ProxyConfig::new()
            .without_ca()
            .with_tag_header(Some(("bad header".into(), "x".into())));
        assert!(ProxyServer::new(config, Database::in_memory().unwrap()).is_err());
    }

    #[tokio::test]
    async fn proxy_handle_reports_bound_addr_and_stops() {
        let harness = Harness::new();
        let (server, handle) = harness.start(harness.config(&["dawn.com"])).await;

        assert_ne!(handle.addr().port(), 0);
        assert!(server.intercepts_tls());
        assert!(server
            .ca_cert_path()
            .unwrap()
            .to_string_lossy()
            .contains("tapwire-ca.crt"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn each_completed_request_records_a_pair() {
        let upstream = spawn_upstream().await;
        let harness = Harness::new();
        let (_server, proxy) = harness.start(harness.config(&["127.0.0.1"])).await;

        let mut client = Client::connect(proxy.addr()).await;
        let n = 5;
        for i in 0..n {
            let body = format!("payload {i}");
            let url = format!("http://{upstream}/echo");
            let fetched = client
                .request(Method::POST, &url, &upstream.to_string(), body.as_bytes())
                .await;

            assert_eq!(fetched.status, StatusCode::OK);
            assert_eq!(fetched.body, body.as_bytes());
            assert_eq!(fetched.headers["x-seen-tag"], "tapwire");
        }

        assert_eq!(
            wait_for_count(&harness.db, RecordKind::Traffic, 2 * n).await,
            2 * n
        );

        let records = harness.db.recent_traffic(100).unwrap();
        let connection_id = records[0].connection_id.clone();
        assert!(records.iter().all(|r| r.connection_id == connection_id));

        for sequence in 1..=n {
            let exchange = harness.db.get_exchange(&connection_id, sequence).unwrap();
            assert_eq!(exchange.len(), 2);
            assert_eq!(exchange[0].direction, Direction::Request);
            assert_eq!(exchange[1].direction, Direction::Response);
            assert_eq!(exchange[0].method, "POST");
            assert_eq!(exchange[0].url, format!("http://{upstream}/echo"));
            assert_eq!(exchange[1].status_code, Some(200));
            assert!(exchange[0]
                .headers
                .iter()
                .any(|(name, value)| name == "x-tapwire-agent" && value == "tapwire"));
            assert!(exchange[0].timestamp <= exchange[1].timestamp);
            assert!(!exchange[1].truncated);
        }

        proxy.stop().await;
    }

    #[tokio::test]
    async fn concurrent_connections_lose_nothing() {
        let upstream = spawn_upstream().await;
        let harness = Harness::new();
        let (server, proxy) = harness.start(harness.config(&["127.0.0.1"])).await;
        let proxy_addr = proxy.addr();

        let connections = 8;
        let per_connection = 3;
        let tasks: Vec<_> = (0..connections)
            .map(|_| {
                tokio::spawn(async move {
                    let mut client = Client::connect(proxy_addr).await;
                    for _ in 0..per_connection {
                        let fetched = client.get(&format!("http://{upstream}/big?n=2048")).await;
                        assert_eq!(fetched.body.len(), 2048);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let expected = 2 * connections * per_connection;
        assert_eq!(
            wait_for_count(&harness.db, RecordKind::Traffic, expected).await,
            expected
        );

        let snapshot = server.metrics().snapshot();
        assert_eq!(snapshot.exchanges_recorded, (connections * per_connection) as u64);
        assert_eq!(snapshot.connections_accepted, connections as u64);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn html_responses_become_deduplicated_articles() {
        let upstream = spawn_upstream().await;
        let harness = Harness::new();
        let (server, proxy) = harness.start(harness.config(&["127.0.0.1"])).await;

        let mut client = Client::connect(proxy.addr()).await;
        for _ in 0..3 {
            let fetched = client.get(&format!("http://{upstream}/article")).await;
            assert_eq!(fetched.body, ARTICLE_HTML.as_bytes());
        }

        wait_for_count(&harness.db, RecordKind::Traffic, 6).await;
        assert_eq!(wait_for_count(&harness.db, RecordKind::Article, 1).await, 1);

        // Give later extractions time to land before checking dedup.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.db.count(RecordKind::Article).unwrap(), 1);

        let articles = harness.db.recent_articles(10).unwrap();
        assert_eq!(articles[0].title, "Example");
        assert_eq!(articles[0].url, format!("http://{upstream}/article"));
        assert!(articles[0].content_excerpt.starts_with("First paragraph"));
        assert_eq!(server.metrics().snapshot().articles_extracted, 1);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn oversized_body_is_truncated_at_bound() {
        let upstream = spawn_upstream().await;
        let harness = Harness::new();
        let config = harness
            .config(&["127.0.0.1"])
            .with_max_body_capture(1024);
        let (_server, proxy) = harness.start(config).await;

        let mut client = Client::connect(proxy.addr()).await;
        let fetched = client.get(&format!("http://{upstream}/big?n=4096")).await;
        assert_eq!(fetched.body.len(), 4096);

        wait_for_count(&harness.db, RecordKind::Traffic, 2).await;
        let records = harness.db.recent_traffic(2).unwrap();
        let response = records
            .iter()
            .find(|r| r.direction == Direction::Response)
            .unwrap();

        assert!(response.truncated);
        assert_eq!(response.body.len(), 1024);
        assert_eq!(response.body_len, 1024);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn non_target_requests_pass_through_unrecorded() {
        let upstream = spawn_upstream().await;
        let harness = Harness::new();
        let (_server, proxy) = harness.start(harness.config(&["dawn.com"])).await;

        let mut client = Client::connect(proxy.addr()).await;
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let fetched = client
            .request(
                Method::POST,
                &format!("http://{upstream}/echo"),
                &upstream.to_string(),
                &payload,
            )
            .await;

        assert_eq!(fetched.body, payload);
        // Only intercepted requests are tagged.
        assert_eq!(fetched.headers["x-seen-tag"], "none");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.db.count(RecordKind::Traffic).unwrap(), 0);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn connect_to_non_target_is_a_raw_tunnel() {
        let upstream = spawn_tls_upstream().await;
        let harness = Harness::new();
        let (_server, proxy) = harness.start(harness.config(&["dawn.com"])).await;

        let authority = format!("localhost:{}", upstream.addr.port());
        let mut client = tls_through_proxy(proxy.addr(), &authority, &upstream.cert)
            .await
            .unwrap();
        let fetched = client
            .request(Method::GET, "/article", &authority, b"")
            .await;
        assert_eq!(fetched.body, ARTICLE_HTML.as_bytes());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.db.count(RecordKind::Traffic).unwrap(), 0);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn tls_to_target_is_intercepted() {
        let upstream = spawn_tls_upstream().await;
        let harness = Harness::new();
        let config = harness
            .config(&["localhost"])
            .with_upstream_root(upstream.cert.clone());
        let (_server, proxy) = harness.start(config).await;

        let authority = format!("localhost:{}", upstream.addr.port());
        let mut client = tls_through_proxy(proxy.addr(), &authority, &harness.ca_cert())
            .await
            .unwrap();
        for _ in 0..2 {
            let fetched = client
                .request(Method::GET, "/article", &authority, b"")
                .await;
            assert_eq!(fetched.status, StatusCode::OK);
            assert_eq!(fetched.body, ARTICLE_HTML.as_bytes());
        }

        assert_eq!(wait_for_count(&harness.db, RecordKind::Traffic, 4).await, 4);
        assert_eq!(wait_for_count(&harness.db, RecordKind::Article, 1).await, 1);

        let records = harness.db.recent_traffic(10).unwrap();
        let expected_url = format!("https://{authority}/article");
        assert!(records.iter().all(|r| r.url == expected_url));
        assert!(records.iter().all(|r| r.note.is_none()));

        proxy.stop().await;
    }

    #[tokio::test]
    async fn missing_ca_degrades_to_tunnel_with_note() {
        let upstream = spawn_tls_upstream().await;
        let ca_parent = TempDir::new().unwrap();
        let blocked = ca_parent.path().join("ca");
        std::fs::write(&blocked, b"a file where the CA directory should be").unwrap();

        let db = Database::in_memory().unwrap();
        let config = ProxyConfig::new()
            .with_port(0)
            .with_ca_manager(CaManager::new(&blocked))
            .with_target_domains(TargetDomains::new(["localhost"]));
        let server = ProxyServer::new(config, db.clone()).unwrap();
        assert!(!server.intercepts_tls());
        let proxy = server.start().await.unwrap();

        // The client talks to the real upstream through the relay.
        let authority = format!("localhost:{}", upstream.addr.port());
        let mut client = tls_through_proxy(proxy.addr(), &authority, &upstream.cert)
            .await
            .unwrap();
        let fetched = client
            .request(Method::GET, "/article", &authority, b"")
            .await;
        assert_eq!(fetched.body, ARTICLE_HTML.as_bytes());

        assert_eq!(wait_for_count(&db, RecordKind::Traffic, 1).await, 1);
        let note = &db.recent_traffic(1).unwrap()[0];
        assert_eq!(note.method, "CONNECT");
        assert_eq!(note.direction, Direction::Request);
        assert!(note.truncated);
        assert!(note.note.as_deref().unwrap().contains("CA unavailable"));
        assert_eq!(server.metrics().snapshot().tls_degraded, 1);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn rejected_certificate_switches_host_to_passthrough() {
        let upstream = spawn_tls_upstream().await;
        let harness = Harness::new();
        let config = harness
            .config(&["localhost"])
            .with_upstream_root(upstream.cert.clone());
        let (_server, proxy) = harness.start(config).await;
        let authority = format!("localhost:{}", upstream.addr.port());

        // This client only trusts the upstream, so it refuses our certificate.
        assert!(tls_through_proxy(proxy.addr(), &authority, &upstream.cert)
            .await
            .is_err());

        // The proxy notices the rejection asynchronously; retry briefly.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut client = loop {
            match tls_through_proxy(proxy.addr(), &authority, &upstream.cert).await {
                Ok(client) => break client,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("host never switched to passthrough: {e}"),
            }
        };

        let fetched = client
            .request(Method::GET, "/article", &authority, b"")
            .await;
        assert_eq!(fetched.body, ARTICLE_HTML.as_bytes());

        wait_for_count(&harness.db, RecordKind::Traffic, 1).await;
        let records = harness.db.recent_traffic(10).unwrap();
        assert!(records.iter().all(|r| r.method == "CONNECT"));
        assert!(records[0]
            .note
            .as_deref()
            .unwrap()
            .contains("rejected certificate"));

        proxy.stop().await;
    }

    #[tokio::test]
    async fn stalled_response_times_out_without_partial_records() {
        let upstream = spawn_upstream().await;
        let harness = Harness::new();
        let config = harness
            .config(&["127.0.0.1"])
            .with_idle_timeout(Duration::from_millis(300));
        let (server, proxy) = harness.start(config).await;

        let mut client = Client::connect(proxy.addr()).await;
        let result = client
            .try_request(
                Method::GET,
                &format!("http://{upstream}/stall"),
                &upstream.to_string(),
                b"",
            )
            .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(harness.db.count(RecordKind::Traffic).unwrap(), 0);
        assert_eq!(server.metrics().snapshot().exchanges_recorded, 0);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn slow_client_is_disconnected() {
        let harness = Harness::new();
        let config = harness
            .config(&["127.0.0.1"])
            .with_header_read_timeout(Duration::from_millis(200))
            .with_idle_timeout(Duration::from_millis(200));
        let (_server, proxy) = harness.start(config).await;

        let mut stream = tokio::net::TcpStream::connect(proxy.addr()).await.unwrap();
        stream.write_all(b"GET http://127.0.0.1/ HTTP/1.1\r\n").await.unwrap();

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut buf)).await;
        assert!(read.is_ok(), "connection was not closed");

        proxy.stop().await;
    }

    #[tokio::test]
    async fn unreachable_upstream_gets_502_and_a_noted_pair() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let harness = Harness::new();
        let (_server, proxy) = harness.start(harness.config(&["127.0.0.1"])).await;

        let mut client = Client::connect(proxy.addr()).await;
        let fetched = client.get(&format!("http://{dead}/")).await;
        assert_eq!(fetched.status, StatusCode::BAD_GATEWAY);

        assert_eq!(wait_for_count(&harness.db, RecordKind::Traffic, 2).await, 2);
        let records = harness.db.recent_traffic(2).unwrap();
        let response = records
            .iter()
            .find(|r| r.direction == Direction::Response)
            .unwrap();
        assert_eq!(response.status_code, Some(502));
        assert!(response.note.as_deref().unwrap().starts_with("upstream error"));

        proxy.stop().await;
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_gets_502() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let harness = Harness::new();
        let (_server, proxy) = harness.start(harness.config(&["dawn.com"])).await;

        let (_stream, status) = connect_tunnel(proxy.addr(), &dead.to_string()).await;
        assert_eq!(status, 502);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn new_targets_apply_to_new_connections_only() {
        let upstream = spawn_upstream().await;
        let harness = Harness::new();
        let (server, proxy) = harness.start(harness.config(&["dawn.com"])).await;
        let url = format!("http://{upstream}/big?n=16");

        let mut old = Client::connect(proxy.addr()).await;
        old.get(&url).await;

        let new_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        server.configure(TargetDomains::new(["127.0.0.1"]), new_addr);
        assert_eq!(server.addr(), new_addr);
        assert!(server.target_domains().matches("127.0.0.1"));

        // The old connection keeps its snapshot.
        old.get(&url).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.db.count(RecordKind::Traffic).unwrap(), 0);

        let mut new = Client::connect(proxy.addr()).await;
        new.get(&url).await;
        assert_eq!(wait_for_count(&harness.db, RecordKind::Traffic, 2).await, 2);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn requests_addressed_to_the_proxy_are_refused() {
        let harness = Harness::new();
        let (server, proxy) = harness.start(harness.config(&["127.0.0.1"])).await;
        let addr = proxy.addr();

        // Origin-form with the proxy as Host.
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET / HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 508"));

        // Absolute-form through a loopback name.
        let localhost = format!("localhost:{}", addr.port());
        let mut client = Client::connect(addr).await;
        let fetched = client
            .request(Method::GET, &format!("http://{localhost}/"), &localhost, b"")
            .await;
        assert_eq!(fetched.status, StatusCode::LOOP_DETECTED);

        let (_tunnel, status) = connect_tunnel(addr, &addr.to_string()).await;
        assert_eq!(status, 508);

        tokio::time::sleep(Duration::from_millis(300)).await;
        // Nothing was forwarded back into the listener.
        assert_eq!(server.metrics().snapshot().connections_accepted, 3);
        assert_eq!(harness.db.count(RecordKind::Traffic).unwrap(), 0);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn requests_that_already_passed_through_are_refused() {
        let upstream = spawn_upstream().await;
        let harness = Harness::new();
        let (_server, proxy) = harness.start(harness.config(&["127.0.0.1"])).await;

        let mut stream = tokio::net::TcpStream::connect(proxy.addr()).await.unwrap();
        let request = format!(
            "GET http://{upstream}/echo HTTP/1.1\r\nHost: {upstream}\r\n\
             Via: 1.0 corp-gateway, 1.1 tapwire\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 508"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.db.count(RecordKind::Traffic).unwrap(), 0);

        proxy.stop().await;
    }

    #[tokio::test]
    async fn intercepted_tls_session_stays_active_until_closed() {
        let upstream = spawn_tls_upstream().await;
        let harness = Harness::new();
        let config = harness
            .config(&["localhost"])
            .with_upstream_root(upstream.cert.clone());
        let (server, proxy) = harness.start(config).await;

        let authority = format!("localhost:{}", upstream.addr.port());
        let mut client = tls_through_proxy(proxy.addr(), &authority, &harness.ca_cert())
            .await
            .unwrap();
        let fetched = client
            .request(Method::GET, "/article", &authority, b"")
            .await;
        assert_eq!(fetched.status, StatusCode::OK);

        // The CONNECT exchange is over but the TLS session is still live.
        assert_eq!(server.metrics().snapshot().active_connections, 1);

        drop(client);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while server.metrics().snapshot().active_connections > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.metrics().snapshot().active_connections, 0);

        proxy.stop().await;
    }
}
