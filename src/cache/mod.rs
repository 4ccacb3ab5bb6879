//! Shared distributed cache used for cache-through reads.
//!
//! Keys are deterministic functions of the query (see [`keys`]). Invalidation
//! is advisory: writers delete affected keys best-effort and rely on the TTL
//! for anything they could not reach.
//!
//! # Implementations
//!
//! - [`RedisCache`] - production backend over a multiplexed `ConnectionManager`
//! - [`InMemoryCache`] - single-process backend for tests and local runs

mod memory;
mod redis_cache;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::metrics;

pub use self::memory::InMemoryCache;
pub use self::redis_cache::RedisCache;

/// Key/value cache with per-entry TTL and wildcard deletes.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Delete every key matching a glob `pattern` (`*` and `?` wildcards).
    /// Returns the number of keys removed.
    async fn delete_matching(&self, pattern: &str) -> AppResult<u64>;

    /// Liveness probe for health reporting.
    async fn ping(&self) -> bool;
}

/// Cache key layout shared by every service.
pub mod keys {
    use uuid::Uuid;

    /// Every paginated listing key.
    pub const POST_LISTINGS: &str = "posts:*";

    /// Every cached search result.
    pub const SEARCH_RESULTS: &str = "search:*";

    pub fn post(id: &Uuid) -> String {
        format!("post:{id}")
    }

    pub fn post_listing(page: u32, limit: u32) -> String {
        format!("posts:{page}:{limit}")
    }

    pub fn search(query: &str) -> String {
        format!("search:{query}")
    }
}

/// Read and decode a cached JSON value.
///
/// Backend failures and undecodable entries are logged and reported as a miss
/// so that the caller falls through to the authoritative store.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let raw = match cache.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            metrics::record_cache_lookup(false);
            return None;
        }
        Err(e) => {
            warn!(key, error = %e, "Cache read failed, falling back to store");
            metrics::record_cache_lookup(false);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => {
            debug!(key, "Cache hit");
            metrics::record_cache_lookup(true);
            Some(value)
        }
        Err(e) => {
            warn!(key, error = %e, "Discarding undecodable cache entry");
            metrics::record_cache_lookup(false);
            None
        }
    }
}

/// Encode and store a JSON value. Failures are logged, never returned.
pub async fn put_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(key, error = %e, "Failed to encode cache entry");
            return;
        }
    };

    if let Err(e) = cache.set_ex(key, &raw, ttl).await {
        warn!(key, error = %e, "Cache write failed");
    }
}

/// Best-effort invalidation of exact keys and wildcard patterns.
///
/// Every key and pattern is attempted even when an earlier one fails.
pub async fn invalidate(cache: &dyn Cache, exact: &[String], patterns: &[&str]) {
    for key in exact {
        if let Err(e) = cache.delete(key).await {
            warn!(key = %key, error = %e, "Cache invalidation failed");
        }
    }

    for pattern in patterns {
        match cache.delete_matching(pattern).await {
            Ok(removed) => debug!(pattern, removed, "Invalidated cache keys"),
            Err(e) => warn!(pattern, error = %e, "Cache sweep failed"),
        }
    }
}

/// Glob matcher with `*` (any run) and `?` (any single char), as used by
/// `SCAN MATCH`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some(p);
                resume = t;
                p += 1;
            }
            Some(&c) if c == '?' || Some(&c) == text.get(t) => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some(s) => {
                    p = s + 1;
                    resume += 1;
                    t = resume;
                }
                None => return false,
            },
        }
    }

    pattern.iter().skip(p).all(|c| *c == '*')
}
