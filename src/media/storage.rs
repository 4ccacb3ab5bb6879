//! Binary object storage behind the media service.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AppError, AppResult};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `data` under `public_id` and return its public URL.
    async fn put(&self, public_id: &str, content_type: &str, data: Bytes) -> AppResult<String>;

    /// Remove the object. Removing a missing object succeeds.
    async fn delete(&self, public_id: &str) -> AppResult<()>;
}

/// Objects as files in one directory, served elsewhere under `public_base_url`.
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStorage {
    pub async fn new(root: impl Into<PathBuf>, public_base_url: &str) -> AppResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            AppError::ConfigError(format!(
                "Cannot create media directory {}: {e}",
                root.display()
            ))
        })?;

        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn path_for(&self, public_id: &str) -> AppResult<PathBuf> {
        let valid = !public_id.is_empty()
            && public_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !public_id.starts_with('.');
        if !valid {
            return Err(AppError::Storage(format!("invalid object id {public_id:?}")));
        }
        Ok(self.root.join(public_id))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(&self, public_id: &str, _content_type: &str, data: Bytes) -> AppResult<String> {
        let path = self.path_for(public_id)?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| AppError::Storage(format!("write {}: {e}", path.display())))?;
        debug!(public_id, bytes = data.len(), "Object stored");
        Ok(format!("{}/{public_id}", self.public_base_url))
    }

    async fn delete(&self, public_id: &str) -> AppResult<()> {
        let path = self.path_for(public_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("remove {}: {e}", path.display()))),
        }
    }
}

/// Process-local storage with per-object failure injection.
#[derive(Debug, Default)]
pub struct InMemoryObjectStorage {
    objects: Mutex<HashMap<String, Bytes>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `public_id` fail.
    pub async fn fail_on(&self, public_id: &str) {
        self.failing.lock().await.insert(public_id.to_string());
    }

    pub async fn contains(&self, public_id: &str) -> bool {
        self.objects.lock().await.contains_key(public_id)
    }

    /// Number of put/delete calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn check(&self, public_id: &str) -> AppResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().await.contains(public_id) {
            return Err(AppError::Storage(format!("injected failure for {public_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn put(&self, public_id: &str, _content_type: &str, data: Bytes) -> AppResult<String> {
        self.check(public_id).await?;
        self.objects.lock().await.insert(public_id.to_string(), data);
        Ok(format!("memory://{public_id}"))
    }

    async fn delete(&self, public_id: &str) -> AppResult<()> {
        self.check(public_id).await?;
        self.objects.lock().await.remove(public_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("media-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_local_put_and_delete() {
        let dir = temp_dir();
        let storage = LocalObjectStorage::new(&dir, "http://cdn.local/files/")
            .await
            .unwrap();

        let url = storage
            .put("abc.png", "image/png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        assert_eq!(url, "http://cdn.local/files/abc.png");
        assert!(dir.join("abc.png").exists());

        storage.delete("abc.png").await.unwrap();
        assert!(!dir.join("abc.png").exists());
        // Already gone
        storage.delete("abc.png").await.unwrap();

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_rejects_path_escape() {
        let dir = temp_dir();
        let storage = LocalObjectStorage::new(&dir, "http://x").await.unwrap();

        for id in ["../etc/passwd", "a/b", "", ".hidden"] {
            assert!(storage.delete(id).await.is_err(), "{id:?}");
        }
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_failure_injection() {
        let storage = InMemoryObjectStorage::new();
        storage.put("a", "text/plain", Bytes::new()).await.unwrap();
        storage.fail_on("a").await;

        assert!(storage.delete("a").await.is_err());
        assert!(storage.contains("a").await);
        assert_eq!(storage.calls(), 2);
    }
}
