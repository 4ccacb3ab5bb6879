//! Media metadata records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::MediaRecord;

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn insert(&self, record: &MediaRecord) -> AppResult<()>;

    /// Records among `ids` that exist; unknown ids are skipped.
    async fn find_many(&self, ids: &[Uuid]) -> AppResult<Vec<MediaRecord>>;

    async fn list(&self) -> AppResult<Vec<MediaRecord>>;

    async fn delete(&self, id: Uuid) -> AppResult<bool>;

    async fn ping(&self) -> bool;
}

pub struct PgMediaStore {
    pool: PgPool,
}

impl PgMediaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MediaStore for PgMediaStore {
    async fn insert(&self, record: &MediaRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO media (id, user_id, original_name, mime_type, url, public_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(&record.original_name)
        .bind(&record.mime_type)
        .bind(&record.url)
        .bind(&record.public_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_many(&self, ids: &[Uuid]) -> AppResult<Vec<MediaRecord>> {
        let records = sqlx::query_as::<_, MediaRecord>(
            "SELECT id, user_id, original_name, mime_type, url, public_id, created_at \
             FROM media WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn list(&self) -> AppResult<Vec<MediaRecord>> {
        let records = sqlx::query_as::<_, MediaRecord>(
            "SELECT id, user_id, original_name, mime_type, url, public_id, created_at \
             FROM media ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM media WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMediaStore {
    records: RwLock<HashMap<Uuid, MediaRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: Uuid) -> Option<MediaRecord> {
        self.records.read().await.get(&id).cloned()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Store("media store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn insert(&self, record: &MediaRecord) -> AppResult<()> {
        self.check()?;
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_many(&self, ids: &[Uuid]) -> AppResult<Vec<MediaRecord>> {
        self.check()?;
        let records = self.records.read().await;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }

    async fn list(&self) -> AppResult<Vec<MediaRecord>> {
        self.check()?;
        let mut all: Vec<MediaRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn delete(&self, id: Uuid) -> AppResult<bool> {
        self.check()?;
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn ping(&self) -> bool {
        self.check().is_ok()
    }
}
