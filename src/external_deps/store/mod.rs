//! Shared atomic store used by distributed rate limiters.
//!
//! The store must run the whole token-bucket read/refill/debit/expire cycle
//! atomically on its side; callers only learn whether the debit was granted.

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use self::redis::RedisBucketStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Lua token-bucket script evaluated server side.
///
/// KEYS[1] bucket key; ARGV: capacity, refill rate per second, cost, now
/// (unix seconds, fractional), expiry seconds. Returns 1 on grant, 0 otherwise.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local bucket = redis.call('HMGET', key, 'tokens', 'last_update')
local tokens = tonumber(bucket[1]) or capacity
local last_update = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_update)
local available = math.min(capacity, tokens + (elapsed * rate))
local granted = 0
if available >= requested then
  available = available - requested
  granted = 1
end

redis.call('HSET', key, 'tokens', available, 'last_update', now)
redis.call('EXPIRE', key, ttl)
return granted
"#;

/// One atomic acquisition attempt against a shared bucket.
#[derive(Debug, Clone)]
pub struct BucketRequest<'a> {
    pub key: &'a str,
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub cost: f64,
    pub now_secs: f64,
    pub ttl: Duration,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store unreachable: {0}")]
    Unreachable(String),
    #[error("shared store command failed: {0}")]
    Command(String),
}

#[async_trait]
pub trait SharedBucketStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reachability check performed once when a limiter is created.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Atomically refill and try to debit the bucket described by `request`.
    async fn take_tokens(&self, request: &BucketRequest<'_>) -> Result<bool, StoreError>;
}
