//! Distributed fixed-window rate limiting.
//!
//! Each client key maps to a counter in a shared store. The first hit of a
//! window creates the counter with a TTL equal to the window; every hit is an
//! atomic increment-and-read, so concurrent gateway instances agree on the
//! count without read-then-write races.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppResult;

pub use self::memory::InMemoryRateLimitStore;
pub use self::redis_store::RedisRateLimitStore;

/// Prefix for limiter counters in the shared store.
const KEY_PREFIX: &str = "rl:";

/// Counter state right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// Time until the window resets
    pub resets_in: Duration,
}

/// Shared counter store.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically increment the counter for `key`, starting a new window of
    /// length `window` if none is active.
    async fn hit(&self, key: &str, window: Duration) -> AppResult<WindowHit>;
}

/// Result of [`FixedWindowLimiter::allow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, never less than 1.
    pub fn reset_after_secs(&self) -> u64 {
        let millis = (self.reset_at - Utc::now()).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// Fixed-window limiter: at most `max_requests` per key per `window`.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    max_requests: u32,
    window: Duration,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, max_requests: u32, window: Duration) -> Self {
        Self {
            store,
            max_requests,
            window,
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request for `client_key` and decide whether it may proceed.
    ///
    /// Store failures are returned to the caller, which decides the policy.
    pub async fn allow(&self, client_key: &str) -> AppResult<RateLimitDecision> {
        let key = format!("{KEY_PREFIX}{client_key}");
        let hit = self.store.hit(&key, self.window).await?;

        let limit = u64::from(self.max_requests);
        let remaining = limit.saturating_sub(hit.count);
        let resets_in = chrono::Duration::from_std(hit.resets_in).unwrap_or(chrono::Duration::zero());

        Ok(RateLimitDecision {
            allowed: hit.count <= limit,
            limit: self.max_requests,
            remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
            reset_at: Utc::now() + resets_in,
        })
    }
}
