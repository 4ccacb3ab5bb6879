//! Keeps the search index in step with post events.
//!
//! Both handlers are idempotent: a redelivered `post.created` replaces the
//! document for its `post_id`, and a `post.deleted` for an unknown post only
//! records the tombstone. A `post.created` that lags its `post.deleted` is
//! dropped. After any change the cached search results are swept.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::index::SearchIndex;
use crate::cache::{self, Cache, keys};
use crate::error::AppResult;
use crate::event_bus::EventHandler;
use crate::models::{PostCreated, PostDeleted, SearchDocument};

pub struct SearchProjector {
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn Cache>,
}

impl SearchProjector {
    pub fn new(index: Arc<dyn SearchIndex>, cache: Arc<dyn Cache>) -> Self {
        Self { index, cache }
    }

    async fn sweep_results(&self) {
        cache::invalidate(self.cache.as_ref(), &[], &[keys::SEARCH_RESULTS]).await;
    }
}

#[async_trait]
impl EventHandler<PostCreated> for SearchProjector {
    #[instrument(skip(self, event), fields(post_id = %event.post_id))]
    async fn handle(&self, event: PostCreated) -> AppResult<()> {
        if !self.index.upsert(&SearchDocument::from(&event)).await? {
            info!("Post already deleted, not indexing");
            return Ok(());
        }
        info!("Post indexed");
        self.sweep_results().await;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<PostDeleted> for SearchProjector {
    #[instrument(skip(self, event), fields(post_id = %event.post_id))]
    async fn handle(&self, event: PostDeleted) -> AppResult<()> {
        if self.index.remove(event.post_id).await? {
            info!("Post removed from index");
        } else {
            debug!("Post was not indexed");
        }
        self.sweep_results().await;
        Ok(())
    }
}
