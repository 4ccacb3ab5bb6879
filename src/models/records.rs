//! Records owned by the individual services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// System-of-record post, owned by the post service. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: Uuid,
    pub user_id: String,
    pub content: String,
    pub media_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when creating a post; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub user_id: String,
    pub content: String,
    pub media_ids: Vec<String>,
}

impl NewPost {
    /// Materialize the record with a fresh id and creation time.
    pub fn into_post(self) -> Post {
        Post {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            content: self.content,
            media_ids: self.media_ids,
            created_at: Utc::now(),
        }
    }
}

/// Derived projection of a post, keyed by `post_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub id: Uuid,
    pub post_id: Uuid,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&crate::models::PostCreated> for SearchDocument {
    fn from(event: &crate::models::PostCreated) -> Self {
        Self {
            id: Uuid::new_v4(),
            post_id: event.post_id,
            user_id: event.user_id.clone(),
            content: event.content.clone(),
            created_at: event.created_at,
        }
    }
}

/// Metadata of an uploaded binary asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    pub id: Uuid,
    pub user_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub url: String,
    pub public_id: String,
    pub created_at: DateTime<Utc>,
}
