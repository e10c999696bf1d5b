//! HostProxy - domain and path based reverse proxy and static file gateway
//!
//! - Longest-prefix routing per hostname from a JSON document
//! - Static folders and plain/TLS upstreams, including WebSocket upgrades
//! - SNI certificate resolution with on-demand self-signed issuance
//! - CORS admission per route

pub mod certificate;
pub mod config;
pub mod cors;
pub mod error;
pub mod files;
pub mod proxy;
pub mod routes;
pub mod upstream;

pub use certificate::{CertificateIssuer, CertificateResolver, SelfSignedIssuer};
pub use config::{Config, CorsPolicy, DomainConfig, RouteRule, StaticRule, UpstreamRule};
pub use error::{CertificateError, ConfigError, ProxyError};
pub use proxy::{ProxyConfig, ProxyServer};
pub use routes::{RouteStore, RouteTable};
