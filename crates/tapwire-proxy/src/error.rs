//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// Leaf certificate error.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Upstream could not be reached or answered badly.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Request could not be routed (missing host, bad URI).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] tapwire_storage::StorageError),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Why a leaf certificate could not be served for a host.
#[derive(Debug, Clone, Error)]
pub enum CertificateError {
    /// No CA is loaded.
    #[error("CA unavailable")]
    CaUnavailable,

    /// The host cannot appear in a certificate.
    #[error("unsupported hostname: {0}")]
    UnsupportedHost(String),

    /// A client rejected an earlier certificate for this host.
    #[error("client previously rejected certificate for {0}")]
    Untrusted(String),

    /// Signing or TLS configuration failed.
    #[error("minting failed: {0}")]
    Mint(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
