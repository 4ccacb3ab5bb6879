//! Middleware shared by every service router.
//!
//! ```text
//! Request → Request ID → Tracing → CORS → Body Limit → service-specific layers → Handler
//! ```

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::middleware::RequestIdLayer;

/// Wrap `router` in the layers every service runs.
pub fn with_common_layers(router: Router, config: &Config) -> Router {
    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );

    router
        .layer(DefaultBodyLimit::max(config.max_request_body_size))
        .layer(build_cors_layer(&config.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(RequestIdLayer::new())
}

/// `["*"]` allows any origin; otherwise only the listed, parseable origins.
pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<_> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}
