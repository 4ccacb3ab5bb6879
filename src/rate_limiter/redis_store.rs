use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use super::{RateLimitStore, WindowHit};
use crate::error::AppResult;

/// INCR + PEXPIRE-on-first-hit in one round trip.
///
/// A counter that somehow lost its TTL (e.g. PEXPIRE never ran because the
/// script was interrupted) gets one re-armed, so a key can never pin a
/// client at the cap forever.
const HIT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// Rate-limit counters in Redis, shared by every gateway instance.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisRateLimitStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(HIT_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(&self, key: &str, window: Duration) -> AppResult<WindowHit> {
        let mut conn = self.conn.clone();
        let window_ms = (window.as_millis() as u64).max(1);

        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowHit {
            count,
            resets_in: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }
}
