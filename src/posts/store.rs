//! System of record for posts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::Post;

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn insert(&self, post: &Post) -> AppResult<()>;

    async fn find(&self, id: Uuid) -> AppResult<Option<Post>>;

    /// Newest first.
    async fn list(&self, offset: u64, limit: u32) -> AppResult<Vec<Post>>;

    async fn count(&self) -> AppResult<u64>;

    /// Delete `id` only if `user_id` owns it, returning the removed post.
    /// Absent and not-owned are indistinguishable.
    async fn delete_owned(&self, id: Uuid, user_id: &str) -> AppResult<Option<Post>>;

    async fn ping(&self) -> bool;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgPostStore {
    pool: PgPool,
}

impl PgPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn insert(&self, post: &Post) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO posts (id, user_id, content, media_ids, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(post.id)
        .bind(&post.user_id)
        .bind(&post.content)
        .bind(&post.media_ids)
        .bind(post.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> AppResult<Option<Post>> {
        let post = sqlx::query_as::<_, Post>(
            "SELECT id, user_id, content, media_ids, created_at FROM posts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(post)
    }

    async fn list(&self, offset: u64, limit: u32) -> AppResult<Vec<Post>> {
        let offset = i64::try_from(offset)
            .map_err(|_| AppError::BadRequest("Page out of range".to_string()))?;

        let posts = sqlx::query_as::<_, Post>(
            "SELECT id, user_id, content, media_ids, created_at FROM posts \
             ORDER BY created_at DESC, id DESC OFFSET $1 LIMIT $2",
        )
        .bind(offset)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    async fn count(&self) -> AppResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_owned(&self, id: Uuid, user_id: &str) -> AppResult<Option<Post>> {
        let post = sqlx::query_as::<_, Post>(
            "DELETE FROM posts WHERE id = $1 AND user_id = $2 \
             RETURNING id, user_id, content, media_ids, created_at",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(post)
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local store that counts reads, for cache-through tests.
#[derive(Debug, Default)]
pub struct InMemoryPostStore {
    posts: RwLock<Vec<Post>>,
    reads: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `find`/`list` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Store("post store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PostStore for InMemoryPostStore {
    async fn insert(&self, post: &Post) -> AppResult<()> {
        self.check()?;
        self.posts.write().await.push(post.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> AppResult<Option<Post>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.posts.read().await.iter().find(|p| p.id == id).cloned())
    }

    async fn list(&self, offset: u64, limit: u32) -> AppResult<Vec<Post>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);

        let mut posts = self.posts.read().await.clone();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(posts
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .collect())
    }

    async fn count(&self) -> AppResult<u64> {
        self.check()?;
        Ok(self.posts.read().await.len() as u64)
    }

    async fn delete_owned(&self, id: Uuid, user_id: &str) -> AppResult<Option<Post>> {
        self.check()?;
        let mut posts = self.posts.write().await;
        let position = posts
            .iter()
            .position(|p| p.id == id && p.user_id == user_id);
        Ok(position.map(|i| posts.remove(i)))
    }

    async fn ping(&self) -> bool {
        self.check().is_ok()
    }
}
