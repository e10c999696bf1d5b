//! Error types shared by the routing, certificate and dispatch layers

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or saving the JSON configuration document
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while loading, validating or issuing certificates
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate file missing: {0}")]
    MissingFile(PathBuf),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("certificate generation failed: {0}")]
    Generate(String),

    #[error("private key does not match certificate chain for `{0}`")]
    KeyMismatch(String),

    #[error("certificate `{0}` expires within the renewal window")]
    Expiring(String),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the proxy while handling a connection or request
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("path escapes static root: {0}")]
    PathTraversal(String),

    #[error("upstream {target} unavailable: {reason}")]
    UpstreamUnavailable { target: String, reason: String },

    #[error("upgrade for {host}{path} dropped")]
    UpgradeDropped { host: String, path: String },

    #[error("no context for `{0}`")]
    NoCertificateContext(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] http::Error),
}
