//! Request validation shared by the service handlers.
//!
//! Validation runs synchronously at the request boundary and produces
//! [`AppError::Validation`] (or `BadRequest` for query parameters); it is
//! never retried.

use crate::error::{AppError, AppResult};
use crate::models::{CreatePostRequest, NewPost};

// =============================================================================
// Validation Constants
// =============================================================================

/// Minimum post length in characters.
pub const MIN_CONTENT_LENGTH: usize = 3;

/// Maximum post length in characters.
pub const MAX_CONTENT_LENGTH: usize = 3000;

/// Maximum number of media attachments on one post.
pub const MAX_MEDIA_IDS: usize = 20;

/// Page used when `page` is absent or unparsable.
pub const DEFAULT_PAGE: u32 = 1;

/// Page size used when `limit` is absent or unparsable.
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Upper bound for `limit`; larger values are clamped.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Maximum search query length in characters.
pub const MAX_QUERY_LENGTH: usize = 256;

/// Validate a create-post body and bind it to the authenticated author.
pub fn validate_create_post(request: CreatePostRequest, user_id: &str) -> AppResult<NewPost> {
    let content = request
        .content
        .ok_or_else(|| AppError::Validation("\"content\" is required".to_string()))?;

    let length = content.chars().count();
    if length < MIN_CONTENT_LENGTH {
        return Err(AppError::Validation(format!(
            "\"content\" length must be at least {MIN_CONTENT_LENGTH} characters long"
        )));
    }
    if length > MAX_CONTENT_LENGTH {
        return Err(AppError::Validation(format!(
            "\"content\" length must be less than or equal to {MAX_CONTENT_LENGTH} characters long"
        )));
    }

    let media_ids = request.media_ids.unwrap_or_default();
    if media_ids.len() > MAX_MEDIA_IDS {
        return Err(AppError::Validation(format!(
            "\"mediaIds\" must contain less than or equal to {MAX_MEDIA_IDS} items"
        )));
    }
    if let Some(position) = media_ids.iter().position(|id| id.trim().is_empty()) {
        return Err(AppError::Validation(format!(
            "\"mediaIds[{position}]\" is not allowed to be empty"
        )));
    }

    Ok(NewPost {
        user_id: user_id.to_string(),
        content,
        media_ids,
    })
}

/// Resolve `page`/`limit` query values; garbage falls back to defaults.
pub fn resolve_pagination(page: Option<&str>, limit: Option<&str>) -> (u32, u32) {
    let page = page
        .and_then(|p| p.trim().parse::<u32>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_PAGE);

    let limit = limit
        .and_then(|l| l.trim().parse::<u32>().ok())
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .min(MAX_PAGE_LIMIT);

    (page, limit)
}

/// Validate a full-text search query.
pub fn validate_search_query(query: Option<&str>) -> AppResult<String> {
    let query = query.map(str::trim).unwrap_or_default();

    if query.is_empty() {
        return Err(AppError::BadRequest("Search query is required".to_string()));
    }
    if query.chars().count() > MAX_QUERY_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Search query cannot exceed {MAX_QUERY_LENGTH} characters"
        )));
    }

    Ok(query.to_string())
}
