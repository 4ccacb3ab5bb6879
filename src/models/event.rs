use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Post;

/// A message published on the topic exchange.
///
/// The routing key is carried by the type; the wire payload is the JSON body
/// of the implementing struct and nothing else.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const ROUTING_KEY: &'static str;
}

/// Routing key for [`PostCreated`].
pub const POST_CREATED: &str = "post.created";

/// Routing key for [`PostDeleted`].
pub const POST_DELETED: &str = "post.deleted";

/// Announced by the post service after a post is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCreated {
    pub post_id: Uuid,
    pub user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent for PostCreated {
    const ROUTING_KEY: &'static str = POST_CREATED;
}

impl From<&Post> for PostCreated {
    fn from(post: &Post) -> Self {
        Self {
            post_id: post.id,
            user_id: post.user_id.clone(),
            content: post.content.clone(),
            created_at: post.created_at,
        }
    }
}

/// Announced by the post service after a post is removed by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDeleted {
    pub post_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub media_ids: Vec<String>,
}

impl DomainEvent for PostDeleted {
    const ROUTING_KEY: &'static str = POST_DELETED;
}

impl From<&Post> for PostDeleted {
    fn from(post: &Post) -> Self {
        Self {
            post_id: post.id,
            user_id: post.user_id.clone(),
            media_ids: post.media_ids.clone(),
        }
    }
}
