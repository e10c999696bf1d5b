//! Route table
//! Resolves (hostname, path) to a configured rule using longest segment-prefix matching

use crate::config::{Config, CorsPolicy, RouteRule};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Make sure a path starts and ends with `/`. The empty path becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let mut fixed = String::with_capacity(path.len() + 2);
    if !path.starts_with('/') {
        fixed.push('/');
    }
    fixed.push_str(path);
    if !path.is_empty() && !path.ends_with('/') {
        fixed.push('/');
    }
    fixed
}

/// Split a path into its segments; `/` yields no segments and matches everything
pub fn path_segments(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() && path.len() < 2 {
        return Vec::new();
    }
    trimmed.split('/').collect()
}

#[derive(Debug)]
struct CompiledRoute {
    segments: Vec<String>,
    /// Normalized key, rebuilt from the segments
    key: String,
    rule: RouteRule,
}

impl CompiledRoute {
    fn new(path: &str, rule: RouteRule) -> Self {
        let normalized = normalize_path(path);
        let segments: Vec<String> = path_segments(&normalized)
            .into_iter()
            .map(str::to_string)
            .collect();
        let key = normalize_path(&segments.join("/"));
        Self { segments, key, rule }
    }

    fn matches(&self, request: &[&str]) -> bool {
        request.len() >= self.segments.len()
            && self.segments.iter().zip(request).all(|(a, b)| a == b)
    }
}

#[derive(Debug, Default)]
struct DomainRoutes {
    cert_name: Option<String>,
    /// Most specific first; equal depths keep declaration order
    routes: Vec<CompiledRoute>,
}

/// A rule matched for one request, with defaults resolved
#[derive(Debug, Clone, Copy)]
pub struct ResolvedRoute<'a> {
    pub rule: &'a RouteRule,
    /// Leading characters of the request path consumed by the match
    pub exclude_length: usize,
    pub key: &'a str,
    /// Declared policy; `None` admits only `domain` itself
    pub cors: Option<&'a CorsPolicy>,
    /// Configured domain name the route belongs to
    pub domain: &'a str,
}

impl<'a> ResolvedRoute<'a> {
    /// Request path with the matched prefix removed, always starting with `/`
    pub fn strip_prefix(&self, path: &str) -> String {
        format!("/{}", path.get(self.exclude_length..).unwrap_or(""))
    }
}

/// Immutable snapshot of the routing configuration
#[derive(Debug, Default)]
pub struct RouteTable {
    domains: HashMap<String, DomainRoutes>,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Self {
        let domains = config
            .domains
            .iter()
            .map(|(name, domain)| {
                let mut routes: Vec<CompiledRoute> = domain
                    .routes
                    .iter()
                    .map(|(path, rule)| CompiledRoute::new(path, rule.clone()))
                    .collect();
                routes.sort_by(|a, b| b.segments.len().cmp(&a.segments.len()));

                (
                    name.to_ascii_lowercase(),
                    DomainRoutes {
                        cert_name: domain.cert_name.clone(),
                        routes,
                    },
                )
            })
            .collect();

        Self { domains }
    }

    /// Find the rule for a request. `None` covers both unknown domains and path misses.
    pub fn find<'a>(&'a self, domain: &str, path: &str) -> Option<ResolvedRoute<'a>> {
        let (name, routes) = self.domains.get_key_value(&domain.to_ascii_lowercase())?;
        let normalized = normalize_path(path);
        let request = path_segments(&normalized);

        let route = routes.routes.iter().find(|route| route.matches(&request))?;
        let exclude_length = if route.rule.relative() { route.key.len() } else { 1 };

        Some(ResolvedRoute {
            rule: &route.rule,
            exclude_length,
            key: &route.key,
            cors: route.rule.cors(),
            domain: name,
        })
    }

    pub fn contains_domain(&self, domain: &str) -> bool {
        self.domains.contains_key(&domain.to_ascii_lowercase())
    }

    /// Certificate bundle declared for a domain
    pub fn cert_name(&self, domain: &str) -> Option<&str> {
        self.domains
            .get(&domain.to_ascii_lowercase())
            .and_then(|d| d.cert_name.as_deref())
    }

    /// Domains that declare a certificate bundle
    pub fn cert_names(&self) -> HashMap<String, String> {
        self.domains
            .iter()
            .filter_map(|(name, d)| d.cert_name.clone().map(|cert| (name.clone(), cert)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Shared handle to the active route table; reloads swap the whole table
#[derive(Debug, Clone)]
pub struct RouteStore {
    current: Arc<ArcSwap<RouteTable>>,
}

impl RouteStore {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(RouteTable::from_config(config))
    }

    /// Snapshot used for the duration of one request or handshake
    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    pub fn replace(&self, table: RouteTable) {
        self.current.store(Arc::new(table));
    }
}
