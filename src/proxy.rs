//! Proxy server implementation
//! Accepts HTTP and SNI-routed HTTPS connections and dispatches each request to a static
//! folder or an upstream

use crate::certificate::CertificateResolver;
use crate::config::{RouteRule, StaticRule, UpstreamRule};
use crate::cors::CorsDecision;
use crate::error::ProxyError;
use crate::files;
use crate::routes::{ResolvedRoute, RouteStore};
use crate::upstream::{self, UpstreamClient};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use rustls::server::Acceptor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, BoxError>;

const NOT_FOUND_BODY: &str = "Not found";
const FILE_NOT_FOUND_BODY: &str = "<h1>File not exist</h1>";
const UNAVAILABLE_BODY: &str = "Service unavailable";

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub http_port: u16,
    /// `None` disables the HTTPS listener
    pub https_port: Option<u16>,
    /// Root that static folders are resolved against
    pub volume_path: PathBuf,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: 52080,
            https_port: None,
            volume_path: PathBuf::from("./vol"),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(60),
        }
    }
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, content_type: &'static str, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Hostname part of a `Host` value; bracketed IPv6 literals keep their brackets
fn split_host(authority: &str) -> &str {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    authority.split(':').next().unwrap_or(authority)
}

fn request_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .map(split_host)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE) && has_token(headers, CONNECTION, "upgrade")
}

/// Inbound request facts shared by the log records of one request
struct RequestLog<'a> {
    host: &'a str,
    path: &'a str,
    query: &'a str,
    cors_allowed: bool,
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    routes: RouteStore,
    certificates: Arc<CertificateResolver>,
    upstream: UpstreamClient,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        routes: RouteStore,
        certificates: Arc<CertificateResolver>,
    ) -> Self {
        let upstream = UpstreamClient::new(config.connect_timeout, config.response_timeout);
        Self {
            config,
            routes,
            certificates,
            upstream,
        }
    }

    pub fn routes(&self) -> &RouteStore {
        &self.routes
    }

    /// Bind the configured ports and serve until the process exits
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let http = TcpListener::bind(("0.0.0.0", self.config.http_port)).await?;
        info!("HTTP server listening on {}", http.local_addr()?);

        match self.config.https_port {
            Some(port) => {
                let https = TcpListener::bind(("0.0.0.0", port)).await?;
                info!("HTTPS server listening on {}", https.local_addr()?);
                tokio::join!(self.clone().serve_http(http), self.serve_https(https));
            }
            None => self.serve_http(http).await,
        }

        Ok(())
    }

    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("HTTP accept failed: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let server = self.clone();
            tokio::spawn(async move {
                server.serve_connection(stream, remote_addr, false).await;
            });
        }
    }

    pub async fn serve_https(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("HTTPS accept failed: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let server = self.clone();
            tokio::spawn(async move {
                match server.accept_tls(stream).await {
                    Ok(tls) => server.serve_connection(tls, remote_addr, true).await,
                    Err(e) => debug!("TLS handshake with {} failed: {}", remote_addr, e),
                }
            });
        }
    }

    /// Read the ClientHello, resolve a context for its SNI name, then finish the handshake
    async fn accept_tls(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>, ProxyError> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let server_name = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .ok_or_else(|| ProxyError::NoCertificateContext(String::new()))?;

        let context = self.certificates.resolve(&server_name).await?;
        Ok(start.into_stream(context).await?)
    }

    async fn serve_connection<I>(self: Arc<Self>, io: I, remote_addr: SocketAddr, is_https: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req| {
            let server = self.clone();
            async move { server.dispatch(req, remote_addr, is_https).await }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            debug!("Connection from {} closed: {}", remote_addr, e);
        }
    }

    /// Entry point for one request. Only a dropped upgrade surfaces as an error,
    /// which closes the client connection.
    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_https: bool,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let Some(hostname) = request_hostname(&req) else {
            warn!("Request from {} without Host header", remote_addr);
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "text/plain",
                "Missing Host header",
            ));
        };

        if is_upgrade_request(req.headers()) {
            return self.handle_upgrade(req, &hostname).await;
        }

        Ok(self.handle_request(req, &hostname, remote_addr, is_https).await)
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        hostname: &str,
        remote_addr: SocketAddr,
        is_https: bool,
    ) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        debug!(headers = ?req.headers(), "Inbound headers for {}{}", hostname, path);

        let table = self.routes.load();
        let Some(route) = table.find(hostname, &path) else {
            info!(
                in_host = %hostname,
                in_path = %path,
                in_query = %query,
                cors_allowed = false,
                proxy_type = "NOT_FOUND",
                "Request"
            );
            return text_response(StatusCode::NOT_FOUND, "text/plain", NOT_FOUND_BODY);
        };

        let cors = CorsDecision::evaluate(route.cors, route.domain, req.headers());
        let log = RequestLog {
            host: hostname,
            path: &path,
            query: &query,
            cors_allowed: cors.allowed,
        };

        if cors.allowed && req.method() == Method::OPTIONS {
            info!(
                in_host = %log.host,
                in_path = %log.path,
                in_query = %log.query,
                cors_allowed = true,
                "Preflight"
            );
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::NO_CONTENT;
            cors.apply_preflight(req.headers(), response.headers_mut());
            return response;
        }

        let mut response = match route.rule {
            RouteRule::Static(rule) => self.serve_static(req.method(), rule, &route, &log).await,
            RouteRule::Upstream(rule) => {
                self.forward(req, rule, &route, &log, remote_addr, is_https)
                    .await
            }
        };

        cors.apply(response.headers_mut());
        response
    }

    async fn serve_static(
        &self,
        method: &Method,
        rule: &StaticRule,
        route: &ResolvedRoute<'_>,
        log: &RequestLog<'_>,
    ) -> Response<ProxyBody> {
        let file_path = route.strip_prefix(log.path);

        let resolved = match files::resolve_file(&self.config.volume_path, &rule.folder, &file_path).await {
            Ok(resolved) => resolved,
            Err(ProxyError::PathTraversal(path)) => {
                warn!("Rejected path {} outside static folder {}", path, rule.folder);
                return text_response(StatusCode::FORBIDDEN, "text/plain", "Forbidden");
            }
            Err(e) => {
                info!(
                    in_host = %log.host,
                    in_path = %log.path,
                    in_query = %log.query,
                    cors_allowed = log.cors_allowed,
                    proxy_type = "STATIC",
                    file_path = %file_path,
                    file_found = false,
                    "Request"
                );
                debug!("Static lookup failed: {}", e);
                return text_response(StatusCode::NOT_FOUND, "text/html", FILE_NOT_FOUND_BODY);
            }
        };

        info!(
            in_host = %log.host,
            in_path = %log.path,
            in_query = %log.query,
            cors_allowed = log.cors_allowed,
            proxy_type = "STATIC",
            file_path = %resolved.display(),
            file_found = true,
            "Request"
        );

        match files::serve_file(&resolved, method).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to open {}: {}", resolved.display(), e);
                text_response(StatusCode::NOT_FOUND, "text/html", FILE_NOT_FOUND_BODY)
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        rule: &UpstreamRule,
        route: &ResolvedRoute<'_>,
        log: &RequestLog<'_>,
        remote_addr: SocketAddr,
        is_https: bool,
    ) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let out_path = route.strip_prefix(log.path);
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{}", out_path, query),
            None => out_path,
        };
        let effective_host = if rule.rewrite_host {
            rule.target_host.as_str()
        } else {
            log.host
        };
        let target = upstream::target_url(rule);

        info!(
            in_host = %log.host,
            in_path = %log.path,
            in_query = %log.query,
            cors_allowed = log.cors_allowed,
            proxy_type = "DYNAMIC",
            redirected_to = %target,
            out_host = %effective_host,
            out_path = %path_and_query,
            "Request"
        );

        let headers = upstream::merge_headers(
            &rule.headers,
            &parts.headers,
            effective_host,
            remote_addr,
            is_https,
        );
        debug!(headers = ?headers, "Outbound headers for {}", target);

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(path_and_query.as_str())
            .version(Version::HTTP_11);
        if let Some(outbound) = builder.headers_mut() {
            *outbound = headers;
        }
        let outbound = match builder.body(body) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!("Could not build upstream request for {}: {}", target, e);
                return text_response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", UNAVAILABLE_BODY);
            }
        };

        let port = rule
            .port
            .filter(|p| *p != 0)
            .unwrap_or(if rule.use_https { 443 } else { 80 });

        let response = match self
            .upstream
            .send(&rule.target_host, port, rule.use_https, outbound)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("{}", e);
                return text_response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", UNAVAILABLE_BODY);
            }
        };

        let (mut parts, body) = response.into_parts();
        let hop_by_hop: Vec<HeaderName> = parts
            .headers
            .keys()
            .filter(|name| upstream::is_hop_by_hop(name))
            .cloned()
            .collect();
        for name in hop_by_hop {
            parts.headers.remove(name);
        }
        upstream::rewrite_location(
            parts.status,
            &mut parts.headers,
            &upstream::target_authority(&rule.target_host, rule.port),
            effective_host,
        );

        Response::from_parts(parts, body.map_err(BoxError::from).boxed())
    }

    /// Forward a protocol upgrade to `ws://target` and splice both connections after `101`
    async fn handle_upgrade(
        &self,
        mut req: Request<Incoming>,
        hostname: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let path = req.uri().path().to_string();
        let dropped = || ProxyError::UpgradeDropped {
            host: hostname.to_string(),
            path: path.clone(),
        };

        let table = self.routes.load();
        let rule = match table.find(hostname, &path).map(|route| route.rule) {
            Some(RouteRule::Upstream(rule)) => rule.clone(),
            Some(RouteRule::Static(_)) => {
                info!(in_host = %hostname, in_path = %path, proxy_type = "STATIC", "Upgrade dropped");
                return Err(dropped());
            }
            None => {
                info!(in_host = %hostname, in_path = %path, proxy_type = "NOT_FOUND", "Upgrade dropped");
                return Err(dropped());
            }
        };
        drop(table);

        let effective_host = if rule.rewrite_host {
            rule.target_host.as_str()
        } else {
            hostname
        };
        let port = rule.port.filter(|p| *p != 0).unwrap_or(80);
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        info!(
            in_host = %hostname,
            in_path = %path,
            proxy_type = "DYNAMIC",
            redirected_to = %format!("ws://{}", upstream::target_authority(&rule.target_host, rule.port)),
            out_host = %effective_host,
            out_path = %path_and_query,
            "Upgrade"
        );

        let mut headers = req.headers().clone();
        headers.insert(HOST, HeaderValue::from_str(effective_host).map_err(|_| dropped())?);

        let mut builder = Request::builder()
            .method(req.method().clone())
            .uri(path_and_query.as_str())
            .version(Version::HTTP_11);
        if let Some(outbound) = builder.headers_mut() {
            *outbound = headers;
        }
        let outbound = builder.body(Empty::<Bytes>::new())?;

        let mut response = match self
            .upstream
            .send(&rule.target_host, port, false, outbound)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Upgrade for {}{} failed: {}", hostname, path, e);
                return Err(dropped());
            }
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (parts, body) = response.into_parts();
            return Ok(Response::from_parts(parts, body.map_err(BoxError::from).boxed()));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let client_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client, upstream)) => {
                    let mut client = TokioIo::new(client);
                    let mut upstream = TokioIo::new(upstream);
                    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                        debug!("Upgraded connection closed: {}", e);
                    }
                }
                Err(e) => debug!("Upgrade did not complete: {}", e),
            }
        });

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, empty_body()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host() {
        assert_eq!(split_host("test.com"), "test.com");
        assert_eq!(split_host("test.com:52080"), "test.com");
        assert_eq!(split_host("[::1]:8080"), "[::1]");
        assert_eq!(split_host("[::1"), "[::1");
    }

    #[test]
    fn test_request_hostname() {
        let req = Request::builder()
            .uri("/x")
            .header(HOST, "static.test.com:52080")
            .body(())
            .unwrap();
        assert_eq!(request_hostname(&req).as_deref(), Some("static.test.com"));

        let req = Request::builder().uri("http://test.com/x").body(()).unwrap();
        assert_eq!(request_hostname(&req).as_deref(), Some("test.com"));

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_hostname(&req), None);
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade_request(&headers));

        headers.remove(UPGRADE);
        assert!(!is_upgrade_request(&headers));
    }

    #[tokio::test]
    async fn test_text_response() {
        let response = text_response(StatusCode::NOT_FOUND, "text/html", FILE_NOT_FOUND_BODY);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], FILE_NOT_FOUND_BODY.as_bytes());
    }

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.http_port, 52080);
        assert!(config.https_port.is_none());
    }
}
