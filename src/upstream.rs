//! Upstream connections
//! Opens plain or TLS connections to route targets and prepares outbound headers

use crate::config::UpstreamRule;
use crate::error::ProxyError;
use crate::proxy::BoxError;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, LOCATION};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// Connection-scoped headers that are not forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// `host` or `host:port` as configured for a rule
pub fn target_authority(host: &str, port: Option<u16>) -> String {
    match port {
        Some(port) if port != 0 => format!("{}:{}", host, port),
        _ => host.to_string(),
    }
}

/// Base URL requests for a rule are forwarded to
pub fn target_url(rule: &UpstreamRule) -> String {
    let scheme = if rule.use_https { "https" } else { "http" };
    format!("{}://{}", scheme, target_authority(&rule.target_host, rule.port))
}

/// Outbound headers: rule defaults, overlaid by the inbound request, then forwarding headers
pub fn merge_headers(
    defaults: &std::collections::BTreeMap<String, String>,
    inbound: &HeaderMap,
    effective_host: &str,
    remote_addr: SocketAddr,
    is_https: bool,
) -> HeaderMap {
    let mut merged = HeaderMap::new();

    for (key, value) in defaults {
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                merged.insert(name, value);
            }
            _ => warn!("Skipping invalid configured header {}", key),
        }
    }

    for name in inbound.keys() {
        if is_hop_by_hop(name) {
            continue;
        }
        merged.remove(name);
        for value in inbound.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }

    let original_host = inbound.get(HOST).cloned();
    if let Ok(host) = HeaderValue::from_str(effective_host) {
        merged.insert(HOST, host);
    }
    if let Ok(ip) = HeaderValue::from_str(&remote_addr.ip().to_string()) {
        merged.insert("x-forwarded-for", ip);
    }
    if let Some(host) = original_host {
        merged.insert("x-forwarded-host", host);
    }
    merged.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if is_https { "https" } else { "http" }),
    );

    merged
}

/// Point redirects that name the upstream back at the host the client used
pub fn rewrite_location(
    status: StatusCode,
    headers: &mut HeaderMap,
    target_authority: &str,
    effective_host: &str,
) {
    if !matches!(status.as_u16(), 201 | 301 | 302 | 307 | 308) {
        return;
    }
    let Some(mut location) = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Url::parse(v).ok())
    else {
        return;
    };

    let authority = match (location.host_str(), location.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => return,
    };
    if !authority.eq_ignore_ascii_case(target_authority) {
        return;
    }

    if location.set_host(Some(effective_host)).is_err() || location.set_port(None).is_err() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(location.as_str()) {
        headers.insert(LOCATION, value);
    }
}

/// Plain TCP or client TLS stream to an upstream
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Sends single requests to upstreams over fresh HTTP/1.1 connections
#[derive(Clone)]
pub struct UpstreamClient {
    tls: TlsConnector,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
            connect_timeout,
            response_timeout,
        }
    }

    async fn connect(&self, host: &str, port: u16, use_tls: bool) -> io::Result<UpstreamStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        if !use_tls {
            return Ok(UpstreamStream::Plain(stream));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = self.tls.connect(server_name, stream).await?;
        Ok(UpstreamStream::Tls(Box::new(tls)))
    }

    /// Send `req` to `host:port`. Any connect, handshake or timeout failure is `UpstreamUnavailable`.
    pub async fn send<B>(
        &self,
        host: &str,
        port: u16,
        use_tls: bool,
        req: Request<B>,
    ) -> Result<Response<Incoming>, ProxyError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let target = format!("{}:{}", host, port);
        let unavailable = |reason: String| ProxyError::UpstreamUnavailable {
            target: target.clone(),
            reason,
        };

        let stream = tokio::time::timeout(self.connect_timeout, self.connect(host, port, use_tls))
            .await
            .map_err(|_| unavailable("connect timed out".to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let conn_target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream connection {} closed: {}", conn_target, e);
            }
        });

        tokio::time::timeout(self.response_timeout, sender.send_request(req))
            .await
            .map_err(|_| unavailable("response timed out".to_string()))?
            .map_err(|e| unavailable(e.to_string()))
    }
}
