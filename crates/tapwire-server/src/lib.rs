//! Tapwire Server - read-only HTTP query API.
//!
//! Serves the store's contents while the proxy runs.
//!
//! ## Endpoints
//!
//! - `GET /api/summary?recent=N` - Counts and the N most recent articles
//! - `GET /api/health` - Store health, plus proxy counters when wired
//! - `GET /api/traffic?limit=N` - Recent captured messages
//! - `GET /api/events?limit=N` - Recent instrumentation events
//! - `GET /api/articles?limit=N` - Recent extracted articles
//!
//! ## Example
//!
//! ```no_run
//! use tapwire_server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(ServerConfig::default()).unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use tapwire_storage::Database;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default server port.
pub const DEFAULT_PORT: u16 = 8765;

/// Default server host (localhost only).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 8765).
    pub port: u16,
    /// Database path (None = default data directory).
    pub db_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db_path: None,
        }
    }
}

impl ServerConfig {
    /// Creates a config with a specific database path.
    pub fn with_db_path(path: impl Into<String>) -> Self {
        Self {
            db_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] tapwire_storage::StorageError),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// The HTTP API server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a new server with the given configuration.
    pub fn new(config: ServerConfig) -> std::result::Result<Self, ServerError> {
        let db = match &config.db_path {
            Some(path) => Database::with_path(path)?,
            None => Database::new()?,
        };

        Self::with_database(config, db)
    }

    /// Creates a server with an existing database.
    pub fn with_database(
        config: ServerConfig,
        db: Database,
    ) -> std::result::Result<Self, ServerError> {
        Self::with_state(config, AppState::new(db))
    }

    /// Creates a server with custom application state.
    pub fn with_state(
        config: ServerConfig,
        state: AppState,
    ) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the process exits.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::result::Result<(), ServerError> {
        let listener = bind(self.addr)?;
        info!("Starting Tapwire API server on {}", self.addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))?;

        info!("API server stopped");
        Ok(())
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

fn router(state: AppState) -> Router {
    // Read-only endpoints; any local dashboard may query them.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/summary", get(handlers::get_summary))
        .route("/api/health", get(handlers::get_health))
        .route("/api/traffic", get(handlers::get_traffic))
        .route("/api/traffic/{id}", get(handlers::get_traffic_record))
        .route("/api/events", get(handlers::get_events))
        .route("/api/articles", get(handlers::get_articles))
        .layer(cors)
        .with_state(state)
}

/// Binds with `SO_REUSEADDR` so a restart does not trip over lingering sockets.
fn bind(addr: SocketAddr) -> std::result::Result<tokio::net::TcpListener, ServerError> {
    let bind_error = |e| ServerError::BindError(addr, e);

    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(128).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener).map_err(bind_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tapwire_proxy::ProxyMetrics;
    use tapwire_storage::{Direction, NewArticle, NewInstrumentationEvent, NewTraffic};
    use tower::ServiceExt;

    fn seeded_db() -> Database {
        let db = Database::in_memory().unwrap();

        for sequence in 1..=3 {
            let message = |direction| NewTraffic {
                connection_id: "conn-1".to_string(),
                sequence,
                direction,
                method: "GET".to_string(),
                url: format!("https://www.dawn.com/news/{sequence}"),
                status_code: (direction == Direction::Response).then_some(200),
                headers: vec![("host".into(), "www.dawn.com".into())],
                body: b"<html></html>".to_vec(),
                truncated: false,
                note: None,
            };
            db.append_exchange(&message(Direction::Request), &message(Direction::Response))
                .unwrap();
        }

        db.append_instrumentation(&NewInstrumentationEvent::hook(
            Some(42),
            "ssl_write",
            json!({"type": "ssl_write"}),
        ))
        .unwrap();

        for i in 0..7 {
            db.append_article_if_absent(&NewArticle {
                url: format!("https://www.dawn.com/news/{i}"),
                title: format!("Story {i}"),
                content_excerpt: "Excerpt".to_string(),
                content_hash: format!("hash-{i}"),
            })
            .unwrap();
        }

        db
    }

    fn create_test_app(state: AppState) -> Router {
        router(state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_summary_defaults_to_five_recent() {
        let app = create_test_app(AppState::new(seeded_db()));

        let (status, json) = get_json(app, "/api/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["traffic_count"], 6);
        assert_eq!(json["instrumentation_count"], 1);
        assert_eq!(json["article_count"], 7);
        assert_eq!(json["recent_articles"].as_array().unwrap().len(), 5);
        assert_eq!(json["recent_articles"][0]["title"], "Story 6");
    }

    #[tokio::test]
    async fn test_summary_recent_parameter() {
        let app = create_test_app(AppState::new(seeded_db()));

        let (status, json) = get_json(app, "/api/summary?recent=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["recent_articles"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_negative_limit_is_bad_request() {
        let app = create_test_app(AppState::new(seeded_db()));

        let (status, json) = get_json(app, "/api/traffic?limit=-1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_get_traffic() {
        let app = create_test_app(AppState::new(seeded_db()));

        let (status, json) = get_json(app, "/api/traffic?limit=4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["kind"], "traffic");
        assert_eq!(json["total"], 6);

        let records = json["records"].as_array().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["direction"], "response");
        // Bodies stay in the store.
        assert!(records[0].get("body").is_none());
    }

    #[tokio::test]
    async fn test_get_traffic_record_by_id() {
        let db = seeded_db();
        let newest = db.recent_traffic(1).unwrap().remove(0);

        let (status, json) = get_json(
            create_test_app(AppState::new(db.clone())),
            &format!("/api/traffic/{}", newest.id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], newest.id);
        assert_eq!(json["url"], "https://www.dawn.com/news/3");
        assert_eq!(json["status_code"], 200);

        let (status, json) = get_json(create_test_app(AppState::new(db)), "/api/traffic/9999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");
    }

    #[tokio::test]
    async fn test_get_events_and_articles() {
        let db = seeded_db();

        let (_, events) = get_json(create_test_app(AppState::new(db.clone())), "/api/events").await;
        assert_eq!(events["kind"], "instrumentation");
        assert_eq!(events["records"][0]["hook_name"], "ssl_write");
        assert_eq!(events["records"][0]["success"], true);

        let (_, articles) =
            get_json(create_test_app(AppState::new(db)), "/api/articles?limit=100").await;
        assert_eq!(articles["kind"], "article");
        assert_eq!(articles["records"].as_array().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_health_with_proxy_metrics() {
        let metrics = ProxyMetrics::new();
        metrics.exchange_recorded();
        let state = AppState::new(Database::in_memory().unwrap()).with_proxy_metrics(metrics);

        let (status, json) = get_json(create_test_app(state), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["store"]["degraded"], false);
        assert_eq!(json["proxy"]["exchanges_recorded"], 1);
    }

    #[tokio::test]
    async fn test_health_without_proxy() {
        let app = create_test_app(AppState::new(Database::in_memory().unwrap()));

        let (_, json) = get_json(app, "/api/health").await;
        assert!(json.get("proxy").is_none());
    }

    #[tokio::test]
    async fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.db_path.is_none());
    }

    #[tokio::test]
    async fn test_run_until_serves_and_stops() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = Server::with_database(
            ServerConfig::default().with_port(port),
            Database::in_memory().unwrap(),
        )
        .unwrap();
        assert_eq!(server.addr().port(), port);

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        let mut connected = false;
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                connected = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(connected);

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
