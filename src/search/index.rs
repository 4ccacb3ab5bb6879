//! Full-text projection of posts, keyed by `post_id`.
//!
//! Removing a post leaves a tombstone for its `post_id`. A `post.created`
//! that arrives after the matching `post.deleted` (the two routing keys are
//! consumed independently) finds the tombstone and is dropped, so a deleted
//! post never comes back into the index.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::SearchDocument;

/// Most documents a query returns.
pub const MAX_RESULTS: u32 = 10;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the document for `doc.post_id`. Returns false when
    /// the post has already been removed.
    async fn upsert(&self, doc: &SearchDocument) -> AppResult<bool>;

    /// Remove the document for `post_id` and tombstone the id. Returns
    /// whether a document existed.
    async fn remove(&self, post_id: Uuid) -> AppResult<bool>;

    /// Relevance-ranked matches, at most `limit`.
    async fn search(&self, query: &str, limit: u32) -> AppResult<Vec<SearchDocument>>;

    async fn ping(&self) -> bool;
}

// =============================================================================
// Postgres
// =============================================================================

/// Postgres full-text index over a generated `tsvector` column.
pub struct PgSearchIndex {
    pool: PgPool,
}

impl PgSearchIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Serializes index writes for one post across handlers and replicas.
async fn lock_post(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    post_id: Uuid,
) -> AppResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
        .bind(post_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl SearchIndex for PgSearchIndex {
    async fn upsert(&self, doc: &SearchDocument) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        lock_post(&mut tx, doc.post_id).await?;

        // Redelivery keeps the original document id
        let result = sqlx::query(
            "INSERT INTO search_posts (id, post_id, user_id, content, created_at) \
             SELECT $1, $2, $3, $4, $5 \
             WHERE NOT EXISTS (SELECT 1 FROM deleted_posts WHERE post_id = $2) \
             ON CONFLICT (post_id) DO UPDATE SET \
               user_id = EXCLUDED.user_id, \
               content = EXCLUDED.content, \
               created_at = EXCLUDED.created_at",
        )
        .bind(doc.id)
        .bind(doc.post_id)
        .bind(&doc.user_id)
        .bind(&doc.content)
        .bind(doc.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, post_id: Uuid) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        lock_post(&mut tx, post_id).await?;

        sqlx::query("INSERT INTO deleted_posts (post_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM search_posts WHERE post_id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(&self, query: &str, limit: u32) -> AppResult<Vec<SearchDocument>> {
        let docs = sqlx::query_as::<_, SearchDocument>(
            "SELECT id, post_id, user_id, content, created_at \
             FROM search_posts, websearch_to_tsquery('english', $1) AS q \
             WHERE document @@ q \
             ORDER BY ts_rank(document, q) DESC, created_at DESC \
             LIMIT $2",
        )
        .bind(query)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(docs)
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local index. Ranks by the number of query terms a document
/// contains, newest first among equals.
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    docs: RwLock<HashMap<Uuid, SearchDocument>>,
    deleted: RwLock<HashSet<Uuid>>,
    unavailable: AtomicBool,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    pub async fn get(&self, post_id: Uuid) -> Option<SearchDocument> {
        self.docs.read().await.get(&post_id).cloned()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Store("search index unavailable".to_string()));
        }
        Ok(())
    }
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, doc: &SearchDocument) -> AppResult<bool> {
        self.check()?;
        let mut docs = self.docs.write().await;
        if self.deleted.read().await.contains(&doc.post_id) {
            return Ok(false);
        }
        match docs.get_mut(&doc.post_id) {
            Some(existing) => {
                existing.user_id = doc.user_id.clone();
                existing.content = doc.content.clone();
                existing.created_at = doc.created_at;
            }
            None => {
                docs.insert(doc.post_id, doc.clone());
            }
        }
        Ok(true)
    }

    async fn remove(&self, post_id: Uuid) -> AppResult<bool> {
        self.check()?;
        let mut docs = self.docs.write().await;
        self.deleted.write().await.insert(post_id);
        Ok(docs.remove(&post_id).is_some())
    }

    async fn search(&self, query: &str, limit: u32) -> AppResult<Vec<SearchDocument>> {
        self.check()?;
        let wanted = terms(query);

        let docs = self.docs.read().await;
        let mut scored: Vec<(usize, &SearchDocument)> = docs
            .values()
            .filter_map(|doc| {
                let have = terms(&doc.content);
                let score = wanted.iter().filter(|t| have.contains(t)).count();
                (score > 0).then_some((score, doc))
            })
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then(b.created_at.cmp(&a.created_at)));
        Ok(scored
            .into_iter()
            .take(limit as usize)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn ping(&self) -> bool {
        self.check().is_ok()
    }
}
