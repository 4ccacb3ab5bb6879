use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MediaRecord, Post, SearchDocument};

/// Uniform success envelope: `{success, message, ...payload}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub payload: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, payload: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            payload,
        }
    }
}

/// Payload-free success body.
#[derive(Debug, Serialize)]
pub struct Empty {}

// =============================================================================
// Posts
// =============================================================================

/// Body of `POST /api/posts/create-post`.
///
/// Fields are optional at the serde level so that missing values surface as
/// validation errors with a field name instead of a parse failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub media_ids: Option<Vec<String>>,
}

/// Query string of `GET /api/posts/get-all-posts`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPostsQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PostPayload {
    pub post: Post,
}

/// One page of posts, newest first. Cached verbatim under `posts:{page}:{limit}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostListing {
    pub posts: Vec<Post>,
    pub current_page: u32,
    pub total_pages: u64,
    pub total_posts: u64,
}

#[derive(Debug, Serialize)]
pub struct PostListingPayload {
    pub result: PostListing,
}

// =============================================================================
// Search
// =============================================================================

/// Query string of `GET /api/search/search-posts`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub query: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchPayload {
    pub data: Vec<SearchDocument>,
}

// =============================================================================
// Media
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPayload {
    pub media_id: Uuid,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct MediaListPayload {
    pub medias: Vec<MediaRecord>,
}

// =============================================================================
// Health
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" when every dependency answered, "degraded" otherwise
    pub status: String,
    pub service: String,
    /// Per-dependency status, e.g. `{"cache": true, "event_bus": false}`
    pub dependencies: serde_json::Map<String, serde_json::Value>,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}
