//! Tapwire Proxy - intercepting HTTP/HTTPS proxy.
//!
//! This crate provides a proxy that captures every exchange with a configured
//! set of target domains and stores it through `tapwire-storage`.
//!
//! ## Features
//!
//! - Generates a root CA certificate on first run
//! - Mints per-host certificates on the fly, cached for reuse
//! - Captures only target domains (passthrough for others)
//! - Bounded body capture; bodies are always forwarded whole
//! - Extracts articles from captured HTML pages
//! - Degrades to a plain relay when a certificate cannot be served
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Proxy → CONNECT?
//!                            │
//!             ┌──────────────┴──────────────┐
//!             │ No                          │ Yes
//!             ▼                             ▼
//!        Target host?                  Target host?
//!        │ No      │ Yes               │ No      │ Yes
//!        ▼         ▼                   ▼         ▼
//!   Passthrough  Intercept           Tunnel   TLS intercept ─(mint failed)─→ Tunnel
//!                  │                               │
//!                  ▼                               ▼
//!        Persist pair → Extract article    Intercept inner requests
//! ```

mod ca;
mod capture;
mod connection;
mod domains;
mod error;
mod extractor;
mod io;
mod metrics;
mod proxy;
mod upstream;

#[cfg(test)]
mod testutil;

pub use ca::{CaManager, CertificateAuthority, DEFAULT_CACHE_CAPACITY};
pub use capture::{CaptureBody, Captured, ProxyBody, DEFAULT_MAX_BODY_CAPTURE};
pub use connection::{route, ConnectionPhase};
pub use domains::{normalize_host, TargetDomains, DEFAULT_TARGET_DOMAINS};
pub use error::{CaError, CertificateError, ProxyError, Result};
pub use extractor::{extract_article, Extraction, MAX_EXCERPT_CHARS};
pub use io::IdleTimeout;
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_TAG_HEADER};
pub use upstream::Origin;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
