//! Sliding-window rate limiting.
//!
//! A fixed quota of `limit` permits per rolling `window`, tracked per key.
//! Two interchangeable backends: an in-memory map for single-instance
//! deployments and a remote sorted-set backend (see [`remote`]) when the
//! quota must be shared across gateway instances. Both present identical
//! semantics through the [`RateLimiter`] trait:
//!
//! 1. evict recorded timestamps older than `now - window`
//! 2. deny when `current + n > limit`
//! 3. otherwise record `n` timestamps at `now`
//!
//! A disabled configuration yields [`NoopRateLimiter`], which admits
//! everything.

pub mod middleware;
pub mod remote;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use middleware::{client_ip_key, rate_limit_middleware, KeyFn, RateLimitState};
pub use remote::RemoteRateLimiter;

/// Errors surfaced by rate limiter backends.
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("remote rate limiter error: {0}")]
    Remote(#[from] redis::RedisError),
}

/// Concurrency-safe sliding-window limiter.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit a single request for `key`.
    async fn allow(&self, key: &str) -> Result<bool, RateLimitError> {
        self.allow_n(key, 1).await
    }

    /// Admit `n` requests for `key` atomically: all or none.
    async fn allow_n(&self, key: &str, n: usize) -> Result<bool, RateLimitError>;

    /// Drop all recorded state for `key`.
    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;

    /// Permits left in the current window for `key`, never negative.
    async fn remaining(&self, key: &str) -> Result<usize, RateLimitError>;
}

/// Limiter backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LimiterKind {
    #[default]
    Memory,
    Remote,
}

/// Rate limiting configuration, as carried in the gateway config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: LimiterKind,
    pub limit: usize,
    /// Window length in seconds (`window` accepted as an alias).
    #[serde(alias = "window")]
    pub window_secs: u64,
    pub prefix: String,
    pub remote_addr: String,
    pub remote_db: i64,
    pub remote_password: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: false,
            kind: LimiterKind::Memory,
            limit: 100,
            window_secs: 60,
            prefix: "ratelimit".to_string(),
            remote_addr: "127.0.0.1:6379".to_string(),
            remote_db: 0,
            remote_password: String::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Build the limiter selected by `config`. Disabled configurations get the
/// no-op limiter; the remote backend connects eagerly so that a bad address
/// fails at startup rather than on the first request.
pub async fn build_rate_limiter(
    config: &RateLimitConfig,
) -> Result<Arc<dyn RateLimiter>, RateLimitError> {
    if !config.enabled {
        return Ok(Arc::new(NoopRateLimiter));
    }

    match config.kind {
        LimiterKind::Memory => Ok(Arc::new(MemoryRateLimiter::new(
            config.limit,
            config.window(),
        ))),
        LimiterKind::Remote => Ok(Arc::new(RemoteRateLimiter::connect(config).await?)),
    }
}

/// In-memory sliding-window limiter. All operations run under one mutex,
/// which also gives per-key total ordering of decisions.
pub struct MemoryRateLimiter {
    limit: usize,
    window: Duration,
    requests: Mutex<HashMap<String, Vec<Instant>>>,
}

impl MemoryRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        MemoryRateLimiter {
            limit,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow_n(&self, key: &str, n: usize) -> Result<bool, RateLimitError> {
        let now = Instant::now();
        let mut requests = self.requests.lock();

        let stamps = requests.entry(key.to_string()).or_default();
        let window = self.window;
        stamps.retain(|t| now.duration_since(*t) < window);

        if stamps.len() + n > self.limit {
            return Ok(false);
        }

        stamps.extend(std::iter::repeat(now).take(n));
        Ok(true)
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.requests.lock().remove(key);
        Ok(())
    }

    async fn remaining(&self, key: &str) -> Result<usize, RateLimitError> {
        let now = Instant::now();
        let mut requests = self.requests.lock();

        match requests.get_mut(key) {
            Some(stamps) => {
                let window = self.window;
                stamps.retain(|t| now.duration_since(*t) < window);
                Ok(self.limit.saturating_sub(stamps.len()))
            }
            None => Ok(self.limit),
        }
    }
}

/// Limiter used when rate limiting is disabled: admits everything.
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn allow_n(&self, _key: &str, _n: usize) -> Result<bool, RateLimitError> {
        Ok(true)
    }

    async fn reset(&self, _key: &str) -> Result<(), RateLimitError> {
        Ok(())
    }

    async fn remaining(&self, _key: &str) -> Result<usize, RateLimitError> {
        Ok(usize::MAX)
    }
}
