//! Reverse proxy dispatcher.
//!
//! Forwards an authenticated request to the upstream selected by the
//! [`RouteTable`], rewriting `/v1/...` to `/api/...`. The upstream response is
//! buffered completely before anything is relayed, so a timeout or a broken
//! connection mid-body still turns into a clean error envelope instead of a
//! truncated response.
//!
//! # Header rewriting
//!
//! Request:
//! - hop-by-hop headers, `host` and `content-length` are dropped
//! - any client-supplied `x-user-id` is dropped, then set from the verified
//!   identity when there is one
//! - `content-type` becomes `application/json` unless the body is a
//!   `multipart/form-data` upload, which passes through untouched
//!
//! Response: status, body and end-to-end headers are relayed verbatim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, header};
use tracing::{debug, info, instrument, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::route_table::{Route, RouteTable, upstream_url};
use crate::credentials::AuthenticatedIdentity;
use crate::error::{AppError, AppResult};
use crate::extract::USER_ID_HEADER;
use crate::metrics;

pub struct ProxyDispatcher {
    client: reqwest::Client,
    routes: RouteTable,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    max_body_size: usize,
}

impl ProxyDispatcher {
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the HTTP client cannot be built.
    pub fn new(
        routes: RouteTable,
        timeout: Duration,
        max_body_size: usize,
        breaker: CircuitBreakerConfig,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // Redirects are the client's business, not the gateway's
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        let breakers = routes
            .routes()
            .iter()
            .map(|route| {
                (
                    route.service.clone(),
                    Arc::new(CircuitBreaker::new(route.service.clone(), breaker.clone())),
                )
            })
            .collect();

        Ok(Self {
            client,
            routes,
            breakers,
            max_body_size,
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn breaker(&self, service: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(service)
    }

    /// Forward `req` and relay the upstream response.
    ///
    /// # Errors
    ///
    /// - `NotFound` when no route matches
    /// - `Unauthenticated` when a protected route is reached without identity
    /// - `Upstream` on connection failure, timeout or an open circuit
    #[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn forward(&self, req: Request<Body>) -> AppResult<Response<Body>> {
        info!("Received {} request to {}", req.method(), req.uri());

        let route = self
            .routes
            .resolve(req.uri().path())
            .ok_or_else(|| AppError::NotFound("Route not found".to_string()))?;

        let identity = req.extensions().get::<AuthenticatedIdentity>().cloned();
        if !route.public && identity.is_none() {
            return Err(AppError::Unauthenticated("Unauthorized".to_string()));
        }

        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| AppError::BadRequest(format!("Request body could not be read: {e}")))?;

        let permit = match self.breakers.get(&route.service) {
            Some(breaker) => match breaker.allow_request().await {
                Some(permit) => Some(permit),
                None => {
                    metrics::record_upstream_failure(&route.service, "circuit_open");
                    return Err(upstream_error(route, "circuit open"));
                }
            },
            None => None,
        };

        let started = Instant::now();
        let result = self.exchange(route, identity.as_ref(), parts, body).await;
        metrics::record_upstream_duration(&route.service, started.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                if let Some(permit) = permit {
                    permit.succeeded().await;
                }
                info!(
                    service = %route.service,
                    status = response.status().as_u16(),
                    "Response received from {}: {}",
                    route.service,
                    response.status()
                );
                metrics::record_gateway_request(&route.service, response.status().as_u16());
                Ok(response)
            }
            Err(failure) => {
                if let Some(permit) = permit {
                    permit.failed().await;
                }
                warn!(
                    service = %route.service,
                    kind = failure.kind,
                    reason = %failure.reason,
                    "Upstream exchange failed"
                );
                metrics::record_upstream_failure(&route.service, failure.kind);
                metrics::record_gateway_request(&route.service, 500);
                Err(upstream_error(route, &failure.reason))
            }
        }
    }

    async fn exchange(
        &self,
        route: &Route,
        identity: Option<&AuthenticatedIdentity>,
        parts: Parts,
        body: Bytes,
    ) -> Result<Response<Body>, TransportFailure> {
        let url = upstream_url(route, parts.uri.path(), parts.uri.query());
        let headers = upstream_request_headers(&parts.headers, identity);
        debug!(url = %url, "Forwarding request upstream");

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(TransportFailure::from)?;

        let status = upstream.status();
        let headers = relay_headers(upstream.headers());
        let bytes = upstream.bytes().await.map_err(TransportFailure::from)?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// The upstream could not be reached or did not answer in time.
struct TransportFailure {
    kind: &'static str,
    reason: String,
}

impl From<reqwest::Error> for TransportFailure {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connect"
        } else {
            "io"
        };
        Self {
            kind,
            reason: e.to_string(),
        }
    }
}

fn upstream_error(route: &Route, reason: &str) -> AppError {
    AppError::Upstream {
        service: route.service.clone(),
        reason: reason.to_string(),
    }
}

/// Headers meaningful only for a single transport hop.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
}

/// Headers sent upstream for a client request.
pub fn upstream_request_headers(
    client: &HeaderMap,
    identity: Option<&AuthenticatedIdentity>,
) -> HeaderMap {
    let multipart = is_multipart(client);
    let mut headers = HeaderMap::with_capacity(client.len() + 2);

    for (name, value) in client {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name.as_str() == USER_ID_HEADER
        {
            continue;
        }
        if name == header::CONTENT_TYPE && !multipart {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !multipart {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    if let Some(identity) = identity {
        match HeaderValue::from_str(&identity.user_id) {
            Ok(value) => {
                headers.insert(USER_ID_HEADER, value);
            }
            Err(_) => warn!(user_id = %identity.user_id, "User id is not a valid header value"),
        }
    }

    headers
}

/// End-to-end headers of an upstream response.
fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        // Length is recomputed from the buffered body
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
