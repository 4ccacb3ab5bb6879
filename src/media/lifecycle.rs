//! Removes media orphaned by a deleted post.
//!
//! Each referenced asset is handled on its own: the object is deleted first,
//! then its metadata. A failing asset is logged and keeps its metadata, and the
//! rest of the batch still runs. If anything failed the handler reports an
//! error so the event is redelivered; assets already removed are unknown by
//! then and skipped.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::storage::ObjectStorage;
use super::store::MediaStore;
use crate::error::{AppError, AppResult};
use crate::event_bus::EventHandler;
use crate::models::PostDeleted;

pub struct MediaLifecycle {
    store: Arc<dyn MediaStore>,
    storage: Arc<dyn ObjectStorage>,
}

impl MediaLifecycle {
    pub fn new(store: Arc<dyn MediaStore>, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { store, storage }
    }
}

#[async_trait]
impl EventHandler<PostDeleted> for MediaLifecycle {
    #[instrument(skip(self, event), fields(post_id = %event.post_id, media = event.media_ids.len()))]
    async fn handle(&self, event: PostDeleted) -> AppResult<()> {
        let ids: Vec<Uuid> = event
            .media_ids
            .iter()
            .filter_map(|raw| match Uuid::parse_str(raw) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(media_id = %raw, "Skipping malformed media id");
                    None
                }
            })
            .collect();

        if ids.is_empty() {
            return Ok(());
        }

        let records = self.store.find_many(&ids).await?;
        let mut failed = 0usize;

        for record in &records {
            if let Err(e) = self.storage.delete(&record.public_id).await {
                warn!(media_id = %record.id, public_id = %record.public_id, error = %e, "Object deletion failed, keeping metadata");
                failed += 1;
                continue;
            }
            if let Err(e) = self.store.delete(record.id).await {
                warn!(media_id = %record.id, error = %e, "Metadata deletion failed");
                failed += 1;
                continue;
            }
            info!(media_id = %record.id, "Media deleted");
        }

        if failed > 0 {
            return Err(AppError::Storage(format!(
                "{failed} of {} media deletions failed",
                records.len()
            )));
        }
        Ok(())
    }
}
