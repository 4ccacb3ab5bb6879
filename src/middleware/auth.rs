//! Bearer token authentication for the gateway.
//!
//! Verifies `Authorization: Bearer <token>` with [`CredentialValidator`] and
//! attaches the resulting [`AuthenticatedIdentity`] to the request
//! extensions. Requests that fail verification are answered here with 401
//! and never reach the proxy.
//!
//! # Public Paths
//!
//! - exact bypass paths (`AUTH_BYPASS_PATHS`, default `/health`)
//! - public route prefixes (e.g. `/v1/auth`), matched on segment boundaries
//!
//! # Brute Force Detection
//!
//! Failed verifications are counted per client address with a GCRA limiter.
//! An address that exhausts its budget is reported in the logs and metrics.
//! The response stays 401 either way; throttling is the job of the
//! gateway-wide rate limiter.
//!
//! [`AuthenticatedIdentity`]: crate::credentials::AuthenticatedIdentity

use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, header};
use axum::response::IntoResponse;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::credentials::CredentialValidator;
use crate::error::AppError;
use crate::metrics;

/// Failed attempts per address per minute.
const AUTH_FAILURE_LIMIT: NonZeroU32 = match NonZeroU32::new(10) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

/// Failures an address may burn through at once.
const AUTH_FAILURE_BURST: NonZeroU32 = match NonZeroU32::new(5) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

/// Tracked addresses above which idle entries are pruned.
const FAILURE_TRACKING_PRUNE_AT: usize = 10_000;

type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Whether `path` is `prefix` itself or lies below it.
pub fn matches_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
}

#[derive(Clone)]
pub struct JwtAuthLayer {
    validator: Arc<CredentialValidator>,
    bypass_paths: Arc<Vec<String>>,
    public_prefixes: Arc<Vec<String>>,
    trusted_proxies: Arc<TrustedProxyConfig>,
    failure_limiter: Arc<AuthFailureLimiter>,
}

impl JwtAuthLayer {
    pub fn new(
        validator: CredentialValidator,
        bypass_paths: Vec<String>,
        public_prefixes: Vec<String>,
        trusted_proxies: TrustedProxyConfig,
    ) -> Self {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);

        Self {
            validator: Arc::new(validator),
            bypass_paths: Arc::new(bypass_paths),
            public_prefixes: Arc::new(public_prefixes),
            trusted_proxies: Arc::new(trusted_proxies),
            failure_limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Count a failure against `client`. Returns true once the address has
    /// exhausted its failure budget.
    fn record_failure(&self, client: &str) -> bool {
        let exhausted = self
            .failure_limiter
            .check_key(&client.to_string())
            .is_err();

        if self.failure_limiter.len() > FAILURE_TRACKING_PRUNE_AT {
            self.failure_limiter.retain_recent();
        }
        exhausted
    }

    /// Addresses with failure state currently held.
    pub fn tracked_addresses(&self) -> usize {
        self.failure_limiter.len()
    }

    fn is_public(&self, path: &str) -> bool {
        self.bypass_paths.iter().any(|p| p == path)
            || self
                .public_prefixes
                .iter()
                .any(|prefix| matches_prefix(path, prefix))
    }
}

impl<S> Layer<S> for JwtAuthLayer {
    type Service = JwtAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwtAuthService {
            inner,
            auth: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct JwtAuthService<S> {
    inner: S,
    auth: JwtAuthLayer,
}

impl<S> Service<Request<Body>> for JwtAuthService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let auth = self.auth.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if auth.is_public(req.uri().path()) {
                debug!(path = %req.uri().path(), "Public route, skipping authentication");
                return inner.call(req).await;
            }

            let authorization = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());

            match auth.validator.verify(authorization) {
                Ok(identity) => {
                    debug!(user_id = %identity.user_id, "Request authenticated");
                    req.extensions_mut().insert(identity);
                    inner.call(req).await
                }
                Err(e) => {
                    let client = client_ip(&req, &auth.trusted_proxies).into_owned();
                    let reason = match e {
                        AppError::Unauthenticated(_) => "missing",
                        _ => "invalid",
                    };
                    warn!(
                        client_ip = %client,
                        path = %req.uri().path(),
                        reason,
                        error = %e,
                        "Authentication failed"
                    );
                    metrics::record_auth_rejection(reason);

                    if auth.record_failure(&client) {
                        error!(
                            client_ip = %client,
                            "Repeated authentication failures from address"
                        );
                        metrics::record_auth_failure_burst();
                    }
                    Ok(e.into_response())
                }
            }
        })
    }
}
