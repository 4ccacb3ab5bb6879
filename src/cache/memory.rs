use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Cache, glob_match};
use crate::error::{AppError, AppResult};

/// Process-local cache with TTL expiry.
///
/// Can be switched to "unavailable" to exercise the degraded paths of
/// cache-through callers.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    available: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> AppResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Cache("cache unavailable".to_string()))
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.check_available()?;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.check_available()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> AppResult<u64> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !glob_match(pattern, key));
        Ok((before - entries.len()) as u64)
    }

    async fn ping(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = InMemoryCache::new();
        cache
            .set_ex("short", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(cache.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_matching_counts() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set_ex("search:a", "1", ttl).await.unwrap();
        cache.set_ex("search:b", "1", ttl).await.unwrap();
        cache.set_ex("posts:1:10", "1", ttl).await.unwrap();

        assert_eq!(cache.delete_matching("search:*").await.unwrap(), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_operations() {
        let cache = InMemoryCache::new();
        cache.set_available(false);

        assert!(matches!(cache.get("k").await, Err(AppError::Cache(_))));
        assert!(!cache.ping().await);

        cache.set_available(true);
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
