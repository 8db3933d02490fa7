//! Remote sliding-window backend.
//!
//! State lives in a sorted set per key on an external key-value store,
//! members scored by second-precision timestamp. The evict/count/record
//! sequence runs as a single server-side script so concurrent gateways
//! cannot race between the read and the write. Keys carry a TTL of one
//! window, rounded up — expiry is a safety net for abandoned keys, not
//! part of the correctness argument.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::{RateLimitConfig, RateLimitError, RateLimiter};

/// Evict-count-record in one atomic step.
///
/// KEYS[1] = sorted-set key; ARGV = window_start, now, limit, n,
/// window_secs, token. The token is a caller-supplied nanosecond stamp that
/// keeps members from colliding when two calls land in the same second.
/// Returns `{allowed (0|1), count_after_adjustment}`.
const ALLOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window_start = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local count = tonumber(ARGV[4])
local token = ARGV[6]

redis.call('ZREMRANGEBYSCORE', key, 0, window_start)

local current = redis.call('ZCARD', key)

if current + count > limit then
    return {0, current}
end

for i = 1, count do
    redis.call('ZADD', key, now, token .. ':' .. i)
end

redis.call('EXPIRE', key, math.ceil(ARGV[5]))

return {1, current + count}
"#;

/// Evict expired members and report permits left.
const REMAINING_SCRIPT: &str = r#"
local key = KEYS[1]
local window_start = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])

redis.call('ZREMRANGEBYSCORE', key, 0, window_start)

local current = redis.call('ZCARD', key)

return limit - current
"#;

/// Sliding-window limiter backed by a remote sorted set per key.
pub struct RemoteRateLimiter {
    conn: ConnectionManager,
    allow_script: Script,
    remaining_script: Script,
    limit: usize,
    window: Duration,
    prefix: String,
}

impl RemoteRateLimiter {
    /// Connect to the store named in `config`. Connection failures surface
    /// here so a bad address is caught at startup.
    pub async fn connect(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let url = if config.remote_password.is_empty() {
            format!("redis://{}/{}", config.remote_addr, config.remote_db)
        } else {
            format!(
                "redis://:{}@{}/{}",
                config.remote_password, config.remote_addr, config.remote_db
            )
        };

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(RemoteRateLimiter {
            conn,
            allow_script: Script::new(ALLOW_SCRIPT),
            remaining_script: Script::new(REMAINING_SCRIPT),
            limit: config.limit,
            window: config.window(),
            prefix: config.prefix.clone(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn now_and_window_start(&self) -> (u64, u64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let window_start = now.saturating_sub(self.window.as_secs());
        (now, window_start)
    }

    fn member_token() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    }
}

#[async_trait]
impl RateLimiter for RemoteRateLimiter {
    async fn allow_n(&self, key: &str, n: usize) -> Result<bool, RateLimitError> {
        let (now, window_start) = self.now_and_window_start();
        let mut conn = self.conn.clone();

        let (allowed, _current): (i64, i64) = self
            .allow_script
            .key(self.full_key(key))
            .arg(window_start)
            .arg(now)
            .arg(self.limit as i64)
            .arg(n as i64)
            .arg(self.window.as_secs())
            .arg(Self::member_token().to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(allowed == 1)
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remaining(&self, key: &str) -> Result<usize, RateLimitError> {
        let (_, window_start) = self.now_and_window_start();
        let mut conn = self.conn.clone();

        let remaining: i64 = self
            .remaining_script
            .key(self.full_key(key))
            .arg(window_start)
            .arg(self.limit as i64)
            .invoke_async(&mut conn)
            .await?;

        Ok(remaining.max(0) as usize)
    }
}
