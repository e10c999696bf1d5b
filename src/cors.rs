//! CORS admission
//! Decides whether browser-visible CORS headers are emitted. The decision never blocks proxying.

use crate::config::CorsPolicy;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS, ORIGIN, REFERER, VARY,
};

const ALLOWED_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// Hostname the request claims to come from, taken from `Origin` or `Referer`
pub fn origin_host(headers: &HeaderMap) -> String {
    let raw = headers
        .get(ORIGIN)
        .or_else(|| headers.get(REFERER))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("None");

    let after_scheme = raw.rsplit("//").next().unwrap_or(raw);
    let authority = after_scheme.split('/').next().unwrap_or(after_scheme);
    authority.split(':').next().unwrap_or(authority).to_string()
}

/// Wildcard admits everything, otherwise the origin must end with an allowed suffix
pub fn is_admitted(policy: &CorsPolicy, origin: &str) -> bool {
    match policy {
        CorsPolicy::Any => true,
        CorsPolicy::Origins(allowed) => allowed.iter().any(|suffix| origin.ends_with(suffix.as_str())),
    }
}

/// Admission for a matched route. Without a declared policy only the requested domain is admitted.
pub fn route_admits(policy: Option<&CorsPolicy>, domain: &str, origin: &str) -> bool {
    match policy {
        Some(policy) => is_admitted(policy, origin),
        None => origin.eq_ignore_ascii_case(domain),
    }
}

/// Outcome of the admission check for one request
#[derive(Debug, Clone)]
pub struct CorsDecision {
    pub allowed: bool,
    origin: Option<HeaderValue>,
}

impl CorsDecision {
    pub fn evaluate(policy: Option<&CorsPolicy>, domain: &str, request: &HeaderMap) -> Self {
        Self {
            allowed: route_admits(policy, domain, &origin_host(request)),
            origin: request.get(ORIGIN).cloned(),
        }
    }

    /// Reflect the request origin on admitted responses
    pub fn apply(&self, headers: &mut HeaderMap) {
        if !self.allowed {
            return;
        }
        if let Some(origin) = &self.origin {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        }
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }

    /// Headers for a directly answered preflight
    pub fn apply_preflight(&self, request: &HeaderMap, headers: &mut HeaderMap) {
        self.apply(headers);
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        if let Some(requested) = request.get(ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
            headers.append(VARY, HeaderValue::from_static("Access-Control-Request-Headers"));
        }
    }
}
