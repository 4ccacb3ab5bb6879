//! Post service HTTP handlers.
//!
//! # Endpoints
//!
//! - `POST /api/posts/create-post` - Create a post (201)
//! - `GET /api/posts/get-all-posts?page&limit` - Newest-first listing
//! - `GET /api/posts/get-post/{id}` - Single post
//! - `DELETE /api/posts/delete-post/{id}` - Delete an owned post
//!
//! Every endpoint requires the `x-user-id` header set by the gateway.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use tracing::instrument;

use super::PostService;
use crate::error::AppResult;
use crate::extract::{JsonBody, TrustedUser};
use crate::handlers::health_report;
use crate::models::{
    ApiResponse, CreatePostRequest, Empty, HealthResponse, ListPostsQuery, PostListingPayload,
    PostPayload,
};

/// # Request Body
///
/// ```json
/// { "content": "hello world", "mediaIds": ["5d0c..."] }
/// ```
#[instrument(skip(service, body))]
pub async fn create_post(
    State(service): State<PostService>,
    TrustedUser(user_id): TrustedUser,
    JsonBody(body): JsonBody<CreatePostRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<PostPayload>>)> {
    let post = service.create(&user_id, body).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(
            "Post created successfully",
            PostPayload { post },
        )),
    ))
}

#[instrument(skip(service))]
pub async fn get_all_posts(
    State(service): State<PostService>,
    TrustedUser(_user_id): TrustedUser,
    Query(query): Query<ListPostsQuery>,
) -> AppResult<Json<ApiResponse<PostListingPayload>>> {
    let result = service
        .list(query.page.as_deref(), query.limit.as_deref())
        .await?;

    Ok(Json(ApiResponse::ok(
        "Posts fetched successfully",
        PostListingPayload { result },
    )))
}

#[instrument(skip(service))]
pub async fn get_post(
    State(service): State<PostService>,
    TrustedUser(_user_id): TrustedUser,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<PostPayload>>> {
    let post = service.get(&id).await?;
    Ok(Json(ApiResponse::ok("Post fetched successfully", PostPayload { post })))
}

#[instrument(skip(service))]
pub async fn delete_post(
    State(service): State<PostService>,
    TrustedUser(user_id): TrustedUser,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<Empty>>> {
    service.delete(&id, &user_id).await?;
    Ok(Json(ApiResponse::ok("Post deleted successfully", Empty {})))
}

pub async fn health(State(service): State<PostService>) -> Json<HealthResponse> {
    health_report(
        "post",
        &[
            ("database", service.store_reachable().await),
            ("cache", service.cache_reachable().await),
            ("event_bus", service.bus_connected()),
        ],
    )
}
