//! Post service: the system of record for posts.

mod handlers;
mod service;
mod store;

use axum::Router;
use axum::routing::{delete, get, post};

pub use self::service::PostService;
pub use self::store::{InMemoryPostStore, PgPostStore, PostStore};

use crate::config::Config;
use crate::routes::with_common_layers;

pub fn build_post_router(service: PostService, config: &Config) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/posts/create-post", post(handlers::create_post))
        .route("/api/posts/get-all-posts", get(handlers::get_all_posts))
        .route("/api/posts/get-post/{id}", get(handlers::get_post))
        .route("/api/posts/delete-post/{id}", delete(handlers::delete_post))
        .with_state(service);

    with_common_layers(router, config)
}
