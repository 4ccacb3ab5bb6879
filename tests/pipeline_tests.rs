//! End-to-end tests of the whole pipeline inside one process.
//!
//! Every service runs as a real HTTP server on an ephemeral port with its
//! in-memory backends; the gateway proxies to them over TCP and a shared
//! in-memory event bus carries `post.created` / `post.deleted` between them.
//!
//! Run with: `cargo test --test pipeline_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use uuid::Uuid;

use social_pipeline::cache::InMemoryCache;
use social_pipeline::credentials::sign_token;
use social_pipeline::event_bus::{InMemoryEventBus, subscribe};
use social_pipeline::media::{InMemoryMediaStore, InMemoryObjectStorage, MediaService};
use social_pipeline::models::{POST_CREATED, POST_DELETED, PostCreated, PostDeleted};
use social_pipeline::posts::{InMemoryPostStore, PostService, PostStore};
use social_pipeline::rate_limiter::{FixedWindowLimiter, InMemoryRateLimitStore};
use social_pipeline::search::{InMemorySearchIndex, SearchService};
use social_pipeline::{
    Config, GatewayConfig, GatewayState, build_gateway_router, build_media_router,
    build_post_router, build_search_router,
};

const SECRET: &str = "pipeline-test-secret";
const TTL: Duration = Duration::from_secs(300);
const MAX_FILE_SIZE: usize = 5 * 1024 * 1024;
const BOUNDARY: &str = "PIPELINEBOUNDARY";

/// Serve `app` on an ephemeral port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{addr}")
}

/// Wrap `app` so every request that reaches it is counted.
fn counted(app: Router, hits: Arc<AtomicUsize>) -> Router {
    app.layer(middleware::from_fn(move |req: Request, next: Next| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            next.run(req).await
        }
    }))
}

/// An upstream that answers every request after `delay`.
async fn slow_upstream(delay: Duration) -> String {
    serve(Router::new().fallback(move || async move {
        tokio::time::sleep(delay).await;
        "too late"
    }))
    .await
}

/// All four services wired together with shared in-memory backends.
struct Pipeline {
    gateway_url: String,
    client: Client,
    /// Requests that reached the post service
    post_hits: Arc<AtomicUsize>,
    bus: Arc<InMemoryEventBus>,
    post_store: Arc<InMemoryPostStore>,
    index: Arc<InMemorySearchIndex>,
    media_store: Arc<InMemoryMediaStore>,
    storage: Arc<InMemoryObjectStorage>,
}

impl Pipeline {
    async fn start() -> Self {
        Self::with_rate_limit(100).await
    }

    async fn with_rate_limit(max_requests: u32) -> Self {
        // Nothing listens on port 1
        Self::build(max_requests, "http://127.0.0.1:1".to_string(), Duration::from_secs(5)).await
    }

    async fn build(
        max_requests: u32,
        identity_service_url: String,
        upstream_timeout: Duration,
    ) -> Self {
        let config = Config::default();
        let cache = Arc::new(InMemoryCache::new());
        let bus = Arc::new(InMemoryEventBus::new());

        let post_store = Arc::new(InMemoryPostStore::new());
        let posts = PostService::new(post_store.clone(), cache.clone(), bus.clone(), TTL);

        let index = Arc::new(InMemorySearchIndex::new());
        let search = SearchService::new(index.clone(), cache.clone(), bus.clone(), TTL);
        let projector = Arc::new(search.projector());
        subscribe::<PostCreated, _>(bus.as_ref(), projector.clone())
            .await
            .unwrap();
        subscribe::<PostDeleted, _>(bus.as_ref(), projector)
            .await
            .unwrap();

        let media_store = Arc::new(InMemoryMediaStore::new());
        let storage = Arc::new(InMemoryObjectStorage::new());
        let media = MediaService::new(
            media_store.clone(),
            storage.clone(),
            bus.clone(),
            MAX_FILE_SIZE,
        );
        subscribe::<PostDeleted, _>(bus.as_ref(), Arc::new(media.lifecycle()))
            .await
            .unwrap();

        let post_hits = Arc::new(AtomicUsize::new(0));
        let gateway = GatewayConfig {
            jwt_secret: SECRET.to_string(),
            identity_service_url,
            post_service_url: serve(counted(
                build_post_router(posts, &config),
                post_hits.clone(),
            ))
            .await,
            media_service_url: serve(build_media_router(media, &config)).await,
            search_service_url: serve(build_search_router(search, &config)).await,
            rate_limit_max_requests: max_requests,
            upstream_timeout,
            ..GatewayConfig::default()
        };

        let limiter = FixedWindowLimiter::new(
            Arc::new(InMemoryRateLimitStore::new()),
            gateway.rate_limit_max_requests,
            gateway.rate_limit_window,
        );
        let state = GatewayState::new(&config, &gateway).unwrap();
        let gateway_url = serve(build_gateway_router(
            state,
            &config,
            &gateway,
            Some(limiter),
        ))
        .await;

        Self {
            gateway_url,
            client: Client::new(),
            post_hits,
            bus,
            post_store,
            index,
            media_store,
            storage,
        }
    }

    fn post_hits(&self) -> usize {
        self.post_hits.load(Ordering::SeqCst)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.gateway_url)
    }

    fn bearer(user_id: &str) -> String {
        format!("Bearer {}", sign_token(SECRET, user_id, 3600).unwrap())
    }

    async fn create_post(&self, user_id: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(self.url("/v1/posts/create-post"))
            .header("authorization", Self::bearer(user_id))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, user_id: &str, path: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .get(self.url(path))
            .header("authorization", Self::bearer(user_id))
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn delete_post(&self, user_id: &str, post_id: &str) -> StatusCode {
        self.client
            .delete(self.url(&format!("/v1/posts/delete-post/{post_id}")))
            .header("authorization", Self::bearer(user_id))
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn upload(&self, user_id: &str, file_name: &str, data: &[u8]) -> (StatusCode, Value) {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: image/png\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let response = self
            .client
            .post(self.url("/v1/media/upload"))
            .header("authorization", Self::bearer(user_id))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    /// Post ids returned by a search through the gateway.
    async fn search_ids(&self, query: &str) -> Vec<String> {
        let (status, body) = self
            .get("U1", &format!("/v1/search/search-posts?query={query}"))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|doc| doc["postId"].as_str().unwrap().to_string())
            .collect()
    }
}

// =============================================================================
// Write path and projection
// =============================================================================

#[tokio::test]
async fn test_created_post_becomes_searchable() {
    let pipeline = Pipeline::start().await;

    let (status, body) = pipeline
        .create_post("U1", json!({ "content": "hello world" }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Post created successfully");
    assert_eq!(body["post"]["userId"], "U1");
    let post_id = body["post"]["id"].as_str().unwrap().to_string();

    let published = pipeline.bus.published_for(POST_CREATED).await;
    assert_eq!(published.len(), 1);
    let event: Value = serde_json::from_str(&published[0].payload).unwrap();
    assert_eq!(event["postId"], post_id.as_str());

    timeout(Duration::from_secs(1), pipeline.bus.wait_idle())
        .await
        .expect("post.created not projected within 1s");
    assert!(pipeline.search_ids("hello").await.contains(&post_id));
}

#[tokio::test]
async fn test_invalid_post_is_rejected_without_event() {
    let pipeline = Pipeline::start().await;

    let (status, body) = pipeline.create_post("U1", json!({ "content": "hi" })).await;

    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["success"], false);
    assert!(pipeline.bus.published().await.is_empty());
}

#[tokio::test]
async fn test_read_after_write_served_from_cache() {
    let pipeline = Pipeline::start().await;
    let (_, body) = pipeline
        .create_post("U1", json!({ "content": "round trip" }))
        .await;
    let post_id = body["post"]["id"].as_str().unwrap().to_string();
    let path = format!("/v1/posts/get-post/{post_id}");

    let reads_before = pipeline.post_store.reads();
    let (status, first) = pipeline.get("U1", &path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["post"]["content"], "round trip");
    assert_eq!(first["post"]["userId"], "U1");

    let (_, second) = pipeline.get("U2", &path).await;
    assert_eq!(second["post"], first["post"]);
    assert_eq!(pipeline.post_store.reads(), reads_before + 1);
}

#[tokio::test]
async fn test_listing_reflects_new_posts() {
    let pipeline = Pipeline::start().await;
    pipeline
        .create_post("U1", json!({ "content": "first post" }))
        .await;

    let (_, before) = pipeline.get("U1", "/v1/posts/get-all-posts?page=1&limit=10").await;
    assert_eq!(before["result"]["totalPosts"], 1);

    pipeline
        .create_post("U1", json!({ "content": "second post" }))
        .await;

    let (_, after) = pipeline.get("U1", "/v1/posts/get-all-posts?page=1&limit=10").await;
    assert_eq!(after["result"]["totalPosts"], 2);
    assert_eq!(after["result"]["posts"][0]["content"], "second post");
}

// =============================================================================
// Delete path
// =============================================================================

#[tokio::test]
async fn test_delete_by_non_owner_is_not_found() {
    let pipeline = Pipeline::start().await;
    let (_, body) = pipeline
        .create_post("U1", json!({ "content": "mine only" }))
        .await;
    let post_id = body["post"]["id"].as_str().unwrap().to_string();

    assert_eq!(
        pipeline.delete_post("U2", &post_id).await,
        StatusCode::NOT_FOUND
    );
    assert!(pipeline.bus.published_for(POST_DELETED).await.is_empty());

    let (status, _) = pipeline
        .get("U1", &format!("/v1/posts/get-post/{post_id}"))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_delete_cleans_up_search_and_media() {
    let pipeline = Pipeline::start().await;

    let (status, upload) = pipeline.upload("U1", "cat.png", b"not really a png").await;
    assert_eq!(status, StatusCode::CREATED, "{upload}");
    assert_eq!(upload["message"], "Media uploaded successfully");
    let media_id = upload["mediaId"].as_str().unwrap().to_string();
    let media_uuid = Uuid::parse_str(&media_id).unwrap();
    let public_id = pipeline.media_store.get(media_uuid).await.unwrap().public_id;

    let (_, body) = pipeline
        .create_post(
            "U1",
            json!({ "content": "cat picture", "mediaIds": [media_id] }),
        )
        .await;
    let post_id = body["post"]["id"].as_str().unwrap().to_string();
    pipeline.bus.wait_idle().await;
    assert_eq!(pipeline.index.len().await, 1);

    assert_eq!(pipeline.delete_post("U1", &post_id).await, StatusCode::OK);
    pipeline.bus.wait_idle().await;

    let deleted = pipeline.bus.published_for(POST_DELETED).await;
    assert_eq!(deleted.len(), 1);
    let event: Value = serde_json::from_str(&deleted[0].payload).unwrap();
    assert_eq!(event["mediaIds"], json!([media_id]));

    assert!(pipeline.index.is_empty().await);
    assert!(pipeline.search_ids("cat").await.is_empty());
    assert!(pipeline.media_store.get(media_uuid).await.is_none());
    assert!(!pipeline.storage.contains(&public_id).await);

    let (status, _) = pipeline
        .get("U1", &format!("/v1/posts/get-post/{post_id}"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Media
// =============================================================================

#[tokio::test]
async fn test_oversized_upload_rejected_before_storage() {
    let pipeline = Pipeline::start().await;

    let (status, body) = pipeline
        .upload("U1", "big.png", &vec![0u8; MAX_FILE_SIZE + 1])
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(pipeline.storage.calls(), 0);
}

#[tokio::test]
async fn test_uploaded_media_listed() {
    let pipeline = Pipeline::start().await;
    pipeline.upload("U1", "a.png", b"a").await;
    pipeline.upload("U2", "b.png", b"b").await;

    let (status, body) = pipeline.get("U1", "/v1/media/get-all-media").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Medias fetched successfully");
    assert_eq!(body["medias"].as_array().unwrap().len(), 2);
}

// =============================================================================
// Gateway
// =============================================================================

#[tokio::test]
async fn test_missing_token_rejected() {
    let pipeline = Pipeline::start().await;

    let response = pipeline
        .client
        .get(pipeline.url("/v1/posts/get-all-posts"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("www-authenticate").unwrap(),
        "Bearer"
    );
    assert_eq!(pipeline.post_hits(), 0);
}

#[tokio::test]
async fn test_bad_tokens_never_reach_backend() {
    let pipeline = Pipeline::start().await;

    for authorization in [None, Some("Bearer"), Some("Bearer forged"), Some("Basic abc")] {
        for _ in 0..4 {
            let mut request = pipeline
                .client
                .post(pipeline.url("/v1/posts/create-post"))
                .json(&json!({ "content": "should not land" }));
            if let Some(value) = authorization {
                request = request.header("authorization", value);
            }
            let response = request.send().await.unwrap();
            assert_eq!(
                response.status(),
                StatusCode::UNAUTHORIZED,
                "{authorization:?}"
            );
        }
    }

    assert_eq!(pipeline.post_hits(), 0);
    assert_eq!(pipeline.post_store.count().await.unwrap(), 0);
    assert!(pipeline.bus.published().await.is_empty());

    // Repeated failures do not lock out a valid token
    let (status, _) = pipeline.get("U1", "/v1/posts/get-all-posts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pipeline.post_hits(), 1);
}

#[tokio::test]
async fn test_forged_user_header_is_replaced() {
    let pipeline = Pipeline::start().await;

    let response = pipeline
        .client
        .post(pipeline.url("/v1/posts/create-post"))
        .header("authorization", Pipeline::bearer("U1"))
        .header("x-user-id", "someone-else")
        .json(&json!({ "content": "who am i" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["post"]["userId"], "U1");
}

#[tokio::test]
async fn test_health_is_public() {
    let pipeline = Pipeline::start().await;

    let response = pipeline
        .client
        .get(pipeline.url("/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["service"], "gateway");
}

#[tokio::test]
async fn test_unreachable_upstream_is_server_error() {
    let pipeline = Pipeline::start().await;

    let response = pipeline
        .client
        .post(pipeline.url("/v1/auth/login"))
        .json(&json!({ "email": "a@b.c", "password": "secret" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_slow_upstream_times_out_with_envelope() {
    let identity = slow_upstream(Duration::from_secs(3)).await;
    let pipeline = Pipeline::build(100, identity, Duration::from_millis(200)).await;

    let started = Instant::now();
    let response = pipeline
        .client
        .post(pipeline.url("/v1/auth/login"))
        .json(&json!({ "email": "a@b.c", "password": "secret" }))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "success": false,
            "message": "Internal server error",
            "error": "Upstream service unavailable",
        })
    );
}

#[tokio::test]
async fn test_rate_limit_exceeded() {
    let pipeline = Pipeline::with_rate_limit(3).await;

    for _ in 0..3 {
        let (status, _) = pipeline.get("U1", "/v1/posts/get-all-posts").await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(pipeline.post_hits(), 3);

    let response = pipeline
        .client
        .get(pipeline.url("/v1/posts/get-all-posts"))
        .header("authorization", Pipeline::bearer("U1"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Too many requests");
    assert_eq!(pipeline.post_hits(), 3);
}
