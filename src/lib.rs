//! # Social Pipeline
//!
//! Backend services for a small social network, kept consistent through an
//! Iggy event bus:
//!
//! - **Gateway**: JWT verification, distributed fixed-window rate limiting,
//!   reverse proxying with per-upstream circuit breakers
//! - **Post service**: system of record for posts, cache-through reads
//! - **Search service**: full-text projection of posts fed by events
//! - **Media service**: uploads, plus cleanup when the owning post is deleted
//!
//! ## Architecture
//!
//! ```text
//!  client ──▶ Gateway (/v1/*) ──▶ Post / Media / Search (/api/*)
//!                                   │
//!                     post.created  │  post.deleted
//!                                   ▼
//!                     ┌──────── Event bus ────────┐
//!                     ▼                           ▼
//!              Search projector          Media lifecycle handler
//! ```
//!
//! Every storage seam (post store, search index, media store, object storage,
//! cache, rate-limit store, event bus) is a trait with a production backend
//! and an in-memory one, so a whole pipeline can run inside one test.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use social_pipeline::cache::InMemoryCache;
//! use social_pipeline::event_bus::InMemoryEventBus;
//! use social_pipeline::posts::{InMemoryPostStore, PostService, build_post_router};
//! use social_pipeline::Config;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::default();
//! let service = PostService::new(
//!     Arc::new(InMemoryPostStore::new()),
//!     Arc::new(InMemoryCache::new()),
//!     Arc::new(InMemoryEventBus::new()),
//!     Duration::from_secs(300),
//! );
//! let app = build_post_router(service, &config);
//! let listener = tokio::net::TcpListener::bind(config.server_addr()).await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod event_bus;
pub mod extract;
pub mod gateway;
pub mod handlers;
pub mod media;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod posts;
pub mod rate_limiter;
pub mod routes;
pub mod search;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::{Config, GatewayConfig, MediaConfig};
pub use error::{AppError, AppResult};
pub use event_bus::{EventBus, EventHandler, IggyEventBus, InMemoryEventBus};
pub use gateway::{GatewayState, build_gateway_router};
pub use media::{MediaService, build_media_router};
pub use posts::{PostService, build_post_router};
pub use search::{SearchService, build_search_router};
