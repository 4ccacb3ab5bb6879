//! Post write and read paths.
//!
//! Writes persist first and then do two best-effort follow-ups: publish the
//! domain event and invalidate the affected cache keys. A write is successful
//! once persisted; a failed follow-up is logged and the affected readers fall
//! back to TTL expiry.
//!
//! Reads are cache-through with an unsynchronized populate: concurrent misses
//! may both load and both write the same value.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::store::PostStore;
use crate::cache::{self, Cache, keys};
use crate::error::{AppError, AppResult};
use crate::event_bus::{EventBus, publish_event};
use crate::models::{CreatePostRequest, DomainEvent, Post, PostCreated, PostDeleted, PostListing};
use crate::validation::{resolve_pagination, validate_create_post};

#[derive(Clone)]
pub struct PostService {
    store: Arc<dyn PostStore>,
    cache: Arc<dyn Cache>,
    bus: Arc<dyn EventBus>,
    cache_ttl: Duration,
}

impl PostService {
    pub fn new(
        store: Arc<dyn PostStore>,
        cache: Arc<dyn Cache>,
        bus: Arc<dyn EventBus>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            cache_ttl,
        }
    }

    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn create(&self, user_id: &str, request: CreatePostRequest) -> AppResult<Post> {
        let post = validate_create_post(request, user_id)?.into_post();
        self.store.insert(&post).await?;
        info!(post_id = %post.id, "Post created");

        self.announce(&PostCreated::from(&post)).await;
        self.invalidate(&post.id).await;

        Ok(post)
    }

    /// Malformed ids are reported exactly like unknown ones.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> AppResult<Post> {
        let id = parse_post_id(id)?;
        let key = keys::post(&id);

        if let Some(post) = cache::get_json::<Post>(self.cache.as_ref(), &key).await {
            return Ok(post);
        }

        let post = self.store.find(id).await?.ok_or_else(post_not_found)?;
        cache::put_json(self.cache.as_ref(), &key, &post, self.cache_ttl).await;
        Ok(post)
    }

    #[instrument(skip(self))]
    pub async fn list(&self, page: Option<&str>, limit: Option<&str>) -> AppResult<PostListing> {
        let (page, limit) = resolve_pagination(page, limit);
        let key = keys::post_listing(page, limit);

        if let Some(listing) = cache::get_json::<PostListing>(self.cache.as_ref(), &key).await {
            return Ok(listing);
        }

        let offset = u64::from(page - 1) * u64::from(limit);
        let posts = self.store.list(offset, limit).await?;
        let total_posts = self.store.count().await?;

        let listing = PostListing {
            posts,
            current_page: page,
            total_pages: total_posts.div_ceil(u64::from(limit)),
            total_posts,
        };
        cache::put_json(self.cache.as_ref(), &key, &listing, self.cache_ttl).await;
        Ok(listing)
    }

    /// Delete a post owned by `user_id`. Absent and not-owned both give
    /// `NotFound`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn delete(&self, id: &str, user_id: &str) -> AppResult<Post> {
        let id = parse_post_id(id)?;
        let post = self
            .store
            .delete_owned(id, user_id)
            .await?
            .ok_or_else(post_not_found)?;
        info!(post_id = %post.id, media = post.media_ids.len(), "Post deleted");

        self.announce(&PostDeleted::from(&post)).await;
        self.invalidate(&post.id).await;

        Ok(post)
    }

    pub async fn store_reachable(&self) -> bool {
        self.store.ping().await
    }

    pub async fn cache_reachable(&self) -> bool {
        self.cache.ping().await
    }

    pub fn bus_connected(&self) -> bool {
        self.bus.is_connected()
    }

    async fn announce<E: DomainEvent>(&self, event: &E) {
        if let Err(e) = publish_event(self.bus.as_ref(), event).await {
            warn!(
                routing_key = E::ROUTING_KEY,
                error = %e,
                "Event publish failed; dependents will not see this change"
            );
        }
    }

    async fn invalidate(&self, id: &Uuid) {
        cache::invalidate(self.cache.as_ref(), &[keys::post(id)], &[keys::POST_LISTINGS]).await;
    }
}

fn parse_post_id(id: &str) -> AppResult<Uuid> {
    Uuid::parse_str(id.trim()).map_err(|_| post_not_found())
}

fn post_not_found() -> AppError {
    AppError::NotFound("Post not found".to_string())
}
