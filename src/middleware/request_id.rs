//! Correlation ids shared by the gateway and the services behind it.
//!
//! The gateway assigns an `X-Request-Id` to every request that arrives
//! without a usable one and forwards it upstream with the rest of the
//! headers, so a post creation can be followed from the gateway log into
//! the post service log. Each service runs the same layer and echoes the id
//! back on its responses.
//!
//! ```bash
//! curl -H "X-Request-Id: trace-me" -H "Authorization: Bearer ..." \
//!      http://localhost:8080/v1/posts
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Client ids longer than this are replaced rather than propagated.
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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
        let request_id = usable_request_id(&req).unwrap_or_else(|| {
            let generated = Uuid::new_v4().to_string();
            // A UUID is always a valid header value
            HeaderValue::from_str(&generated).unwrap_or(HeaderValue::from_static("unknown"))
        });

        // Re-inserted so the proxy forwards whatever id was settled on
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, request_id.clone());

        if let Ok(id) = request_id.to_str() {
            Span::current().record("request_id", id);
            debug!(request_id = %id, method = %req.method(), path = %req.uri().path(), "Request received");
        }

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
            Ok(response)
        })
    }
}

/// The client's id, when it is printable and of sane length.
fn usable_request_id<B>(req: &Request<B>) -> Option<HeaderValue> {
    let value = req.headers().get(REQUEST_ID_HEADER)?;
    let text = value.to_str().ok()?.trim();
    if text.is_empty() || text.len() > MAX_REQUEST_ID_LEN {
        return None;
    }
    Some(value.clone())
}

pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
    }
}
