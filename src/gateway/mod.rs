//! Public entry point: rate limiting, authentication and proxying.
//!
//! ```text
//! Received ─► RateLimited (429)
//!    │
//!    ├──────► AuthRejected (401)
//!    │
//!    └─► Authenticated ─► Proxied ─► ResponseRelayed
//!                                └─► UpstreamFailed (500)
//! ```

mod circuit_breaker;
mod proxy;
mod route_table;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response};
use axum::routing::get;
use tracing::info;

pub use self::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState,
};
pub use self::proxy::{ProxyDispatcher, upstream_request_headers};
pub use self::route_table::{Route, RouteTable, upstream_url};

use crate::config::{Config, GatewayConfig};
use crate::credentials::CredentialValidator;
use crate::error::AppResult;
use crate::handlers::health_report;
use crate::middleware::{JwtAuthLayer, RateLimitLayer, TrustedProxyConfig};
use crate::models::HealthResponse;
use crate::rate_limiter::FixedWindowLimiter;
use crate::routes::with_common_layers;

#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Arc<ProxyDispatcher>,
}

impl GatewayState {
    pub fn new(config: &Config, gateway: &GatewayConfig) -> AppResult<Self> {
        let dispatcher = ProxyDispatcher::new(
            RouteTable::from_config(gateway),
            gateway.upstream_timeout,
            config.max_request_body_size,
            CircuitBreakerConfig::from_gateway(gateway),
        )?;

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
        })
    }
}

/// Build the gateway router. `limiter` is `None` when rate limiting is disabled.
pub fn build_gateway_router(
    state: GatewayState,
    config: &Config,
    gateway: &GatewayConfig,
    limiter: Option<FixedWindowLimiter>,
) -> Router {
    let trusted_proxies = TrustedProxyConfig::new(&gateway.trusted_proxies);
    let auth = JwtAuthLayer::new(
        CredentialValidator::new(&gateway.jwt_secret),
        gateway.auth_bypass_paths.clone(),
        state.dispatcher.routes().public_prefixes(),
        trusted_proxies.clone(),
    );

    for route in state.dispatcher.routes().routes() {
        info!(
            prefix = %route.prefix,
            service = %route.service,
            upstream = %route.upstream,
            public = route.public,
            "Route registered"
        );
    }

    let mut router = Router::new()
        .route("/health", get(health))
        .fallback(proxy)
        .with_state(state)
        .layer(auth);

    // Outside auth so that rejected clients are counted too
    match limiter {
        Some(limiter) => {
            info!(
                max_requests = limiter.max_requests(),
                window_secs = limiter.window().as_secs(),
                trusted_proxies = gateway.trusted_proxies.len(),
                "Rate limiting enabled"
            );
            router = router.layer(RateLimitLayer::new(limiter, trusted_proxies));
        }
        None => info!("Rate limiting disabled (RATE_LIMIT_MAX_REQUESTS=0)"),
    }

    with_common_layers(router, config)
}

async fn proxy(State(state): State<GatewayState>, req: Request<Body>) -> AppResult<Response<Body>> {
    state.dispatcher.forward(req).await
}

async fn health(State(state): State<GatewayState>) -> axum::Json<HealthResponse> {
    let mut upstreams = Vec::new();
    for route in state.dispatcher.routes().routes() {
        let closed = match state.dispatcher.breaker(&route.service) {
            Some(breaker) => breaker.state().await != CircuitState::Open,
            None => true,
        };
        upstreams.push((route.service.as_str(), closed));
    }
    health_report("gateway", &upstreams)
}
