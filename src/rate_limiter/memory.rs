use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RateLimitStore, WindowHit};
use crate::error::{AppError, AppResult};

/// Process-local counters, for tests and single-instance runs.
///
/// Expired windows are swept at most once per window length, so idle
/// clients do not accumulate.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<Windows>,
    failing: AtomicBool,
}

#[derive(Debug, Default)]
struct Windows {
    /// Count and reset time per key
    counters: HashMap<String, (u64, Instant)>,
    next_sweep: Option<Instant>,
}

impl Windows {
    fn sweep_expired(&mut self, now: Instant, window: Duration) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        self.counters.retain(|_, (_, resets_at)| *resets_at > now);
        self.next_sweep = Some(now + window);
    }
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent hit fail, as if the store were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Keys currently holding a counter.
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.counters.len()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(&self, key: &str, window: Duration) -> AppResult<WindowHit> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Cache("rate limit store unavailable".to_string()));
        }

        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows.sweep_expired(now, window);
        let entry = windows
            .counters
            .entry(key.to_string())
            .or_insert((0, now + window));

        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;

        Ok(WindowHit {
            count: entry.0,
            resets_in: entry.1.saturating_duration_since(now),
        })
    }
}
