//! Distributed fixed-window rate limiting for the gateway.
//!
//! Runs before authentication on every route and keys on the client address
//! (see [`super::ip`]). A rejected request never reaches the inner service,
//! so nothing is proxied for it.
//!
//! # Response Headers
//!
//! Every response that went through the limiter carries:
//! - `RateLimit-Limit`: requests allowed per window
//! - `RateLimit-Remaining`: requests left in the current window
//! - `RateLimit-Reset`: seconds until the window resets
//!
//! Rejections (429) additionally carry `Retry-After`.
//!
//! # Store failures
//!
//! When the counter store is unreachable the request is rejected with 500
//! (fail closed) and the degradation is logged.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{error, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::error::AppError;
use crate::metrics;
use crate::rate_limiter::{FixedWindowLimiter, RateLimitDecision};

pub const RATE_LIMIT_LIMIT: &str = "ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "ratelimit-reset";

/// Tower layer applying a [`FixedWindowLimiter`] per client address.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: FixedWindowLimiter,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RateLimitLayer {
    pub fn new(limiter: FixedWindowLimiter, trusted_proxies: TrustedProxyConfig) -> Self {
        Self {
            limiter,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: FixedWindowLimiter,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let client = client_ip(&req, &self.trusted_proxies).into_owned();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let decision = match limiter.allow(&client).await {
                Ok(decision) => decision,
                Err(e) => {
                    error!(client_ip = %client, error = %e, "Rate limit store unavailable, rejecting request");
                    return Ok(AppError::Internal(format!("rate limit store: {e}")).into_response());
                }
            };

            if !decision.allowed {
                warn!(
                    client_ip = %client,
                    path = %req.uri().path(),
                    "Rate limit exceeded"
                );
                metrics::record_rate_limited();

                let mut response = AppError::RateLimited {
                    retry_after_secs: decision.reset_after_secs(),
                }
                .into_response();
                insert_headers(response.headers_mut(), &decision);
                return Ok(response);
            }

            let mut response = inner.call(req).await?;
            insert_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

fn insert_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_after_secs()));
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::rate_limiter::InMemoryRateLimitStore;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(store: Arc<InMemoryRateLimitStore>, max: u32, hits: Arc<AtomicUsize>) -> Router {
        let limiter = FixedWindowLimiter::new(store, max, Duration::from_secs(900));
        Router::new()
            .route(
                "/",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    }
                }),
            )
            .layer(RateLimitLayer::new(limiter, TrustedProxyConfig::default()))
    }

    fn from(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_over_cap_rejected_without_calling_inner() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(Arc::new(InMemoryRateLimitStore::new()), 2, hits.clone());

        for remaining in ["1", "0"] {
            let response = app.clone().oneshot(from("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[RATE_LIMIT_LIMIT], "2");
            assert_eq!(response.headers()[RATE_LIMIT_REMAINING], remaining);
        }

        let response = app.clone().oneshot(from("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert!(response.headers().contains_key(RATE_LIMIT_RESET));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Too many requests");
    }

    #[tokio::test]
    async fn test_clients_have_separate_windows() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(Arc::new(InMemoryRateLimitStore::new()), 1, hits);

        assert_eq!(
            app.clone().oneshot(from("1.1.1.1")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            app.clone().oneshot(from("2.2.2.2")).await.unwrap().status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryRateLimitStore::new());
        store.set_failing(true);
        let app = app(store, 100, hits.clone());

        let response = app.oneshot(from("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
