//! Public path → upstream service resolution.

use crate::config::GatewayConfig;
use crate::middleware::auth::matches_prefix;

/// Public prefix that is rewritten to [`INTERNAL_PREFIX`] before forwarding.
pub const PUBLIC_PREFIX: &str = "/v1";
pub const INTERNAL_PREFIX: &str = "/api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Public prefix, e.g. `/v1/posts`
    pub prefix: String,
    /// Name used in logs and metrics, e.g. `post`
    pub service: String,
    /// Base URL without trailing slash
    pub upstream: String,
    /// Public routes are forwarded without a verified identity
    pub public: bool,
}

impl Route {
    pub fn new(prefix: &str, service: &str, upstream: &str, public: bool) -> Self {
        Self {
            prefix: prefix.to_string(),
            service: service.to_string(),
            upstream: upstream.trim_end_matches('/').to_string(),
            public,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(vec![
            Route::new("/v1/auth", "identity", &config.identity_service_url, true),
            Route::new("/v1/posts", "post", &config.post_service_url, false),
            Route::new("/v1/media", "media", &config.media_service_url, false),
            Route::new("/v1/search", "search", &config.search_service_url, false),
        ])
    }

    /// Longest prefix match on a segment boundary.
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|route| matches_prefix(path, &route.prefix))
            .max_by_key(|route| route.prefix.len())
    }

    /// Prefixes of routes that skip authentication.
    pub fn public_prefixes(&self) -> Vec<String> {
        self.routes
            .iter()
            .filter(|route| route.public)
            .map(|route| route.prefix.clone())
            .collect()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Absolute upstream URL for a public path and query: `/v1/x` → `{base}/api/x`.
pub fn upstream_url(route: &Route, path: &str, query: Option<&str>) -> String {
    let internal = match path.strip_prefix(PUBLIC_PREFIX) {
        Some(rest) => format!("{INTERNAL_PREFIX}{rest}"),
        None => path.to_string(),
    };

    match query {
        Some(q) if !q.is_empty() => format!("{}{internal}?{q}", route.upstream),
        _ => format!("{}{internal}", route.upstream),
    }
}
