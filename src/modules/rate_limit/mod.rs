//! Token-bucket admission control per named resource class.
//!
//! Each limiter refills lazily at `capacity / 60` tokens per second. When a
//! shared store is configured the bucket lives there and is updated by an
//! atomic server-side script; the first store failure downgrades the limiter
//! to its in-process bucket for the rest of its life.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep};

use crate::external_deps::store::{BucketRequest, SharedBucketStore};
use crate::modules::events::{EventDispatcher, FetchEvent};

pub const SEARCH_CLASS: &str = "search";
pub const WEBSITE_CLASS: &str = "website";

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit wait for `{name}` timed out after {waited:?}")]
    Timeout { name: String, waited: Duration },
    #[error("unknown rate limit class `{0}`")]
    UnknownClass(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u32,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per minute keyed by class name.
    pub classes: BTreeMap<String, f64>,
    pub redis: Option<RedisSettings>,
    pub key_prefix: String,
    pub key_ttl_secs: u64,
    pub poll_interval_ms: u64,
    pub default_max_wait_secs: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        classes.insert(SEARCH_CLASS.to_string(), 100.0);
        classes.insert(WEBSITE_CLASS.to_string(), 60.0);
        Self {
            classes,
            redis: None,
            key_prefix: "ratelimit:".into(),
            key_ttl_secs: 120,
            poll_interval_ms: 100,
            default_max_wait_secs: 60.0,
        }
    }
}

impl RateLimitConfig {
    /// `redis://[:password@]host:port/db` when a shared store is configured.
    pub fn redis_url(&self) -> Option<String> {
        self.redis.as_ref().map(|redis| match &redis.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, redis.host, redis.port, redis.db
            ),
            None => format!("redis://{}:{}/{}", redis.host, redis.port, redis.db),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn default_max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.default_max_wait_secs.max(0.0))
    }
}

/// In-process token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Full bucket holding `requests_per_minute` tokens.
    pub fn new(requests_per_minute: f64, now: Instant) -> Self {
        Self {
            capacity: requests_per_minute,
            tokens: requests_per_minute,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill_rate(&self) -> f64 {
        self.capacity / 60.0
    }

    /// Refill for the time elapsed since the last attempt, then debit `cost`
    /// if enough tokens are available. The refill is kept on denial.
    pub fn try_take_at(&mut self, cost: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate()).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens that would be available at `now`, without committing the refill.
    pub fn available_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate()).min(self.capacity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterBackend {
    Memory,
    Shared(&'static str),
}

/// A named limiter shared by every caller of one resource class.
pub struct RateLimiter {
    name: String,
    bucket: Mutex<TokenBucket>,
    store: Option<Arc<dyn SharedBucketStore>>,
    degraded: AtomicBool,
    store_key: String,
    key_ttl: Duration,
    poll_interval: Duration,
    events: RwLock<EventDispatcher>,
}

impl RateLimiter {
    pub fn in_memory(name: impl Into<String>, requests_per_minute: f64) -> Self {
        let name = name.into();
        Self {
            store_key: format!("ratelimit:{name}"),
            bucket: Mutex::new(TokenBucket::new(requests_per_minute, Instant::now())),
            name,
            store: None,
            degraded: AtomicBool::new(false),
            key_ttl: Duration::from_secs(120),
            poll_interval: Duration::from_millis(100),
            events: RwLock::new(EventDispatcher::new()),
        }
    }

    /// Limiter backed by `store`. An unreachable store downgrades the limiter
    /// immediately.
    pub async fn with_store(
        name: impl Into<String>,
        requests_per_minute: f64,
        store: Arc<dyn SharedBucketStore>,
    ) -> Self {
        let mut limiter = Self::in_memory(name, requests_per_minute);
        match store.ping().await {
            Ok(()) => {
                log::info!(
                    "rate limiter `{}` using shared store {}",
                    limiter.name,
                    store.name()
                );
                limiter.store = Some(store);
            }
            Err(err) => {
                log::warn!(
                    "rate limiter `{}` cannot reach {}: {err}; using in-memory bucket",
                    limiter.name,
                    store.name()
                );
            }
        }
        limiter
    }

    pub fn with_events(self, events: EventDispatcher) -> Self {
        self.set_events(events);
        self
    }

    /// Route degraded-mode notifications to `events` from now on.
    pub fn set_events(&self, events: EventDispatcher) {
        *self.events.write() = events;
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.store_key = format!("{prefix}{}", self.name);
        self
    }

    pub fn with_key_ttl(mut self, ttl: Duration) -> Self {
        self.key_ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> f64 {
        self.bucket.lock().capacity()
    }

    pub fn backend(&self) -> LimiterBackend {
        match &self.store {
            Some(store) if !self.degraded.load(Ordering::Acquire) => {
                LimiterBackend::Shared(store.name())
            }
            _ => LimiterBackend::Memory,
        }
    }

    /// Tokens currently available in the in-process bucket.
    pub fn available(&self) -> f64 {
        self.bucket.lock().available_at(Instant::now())
    }

    /// Try to debit `cost` tokens. Never waits for refill.
    pub async fn acquire(&self, cost: u32) -> bool {
        let cost = f64::from(cost);
        if let Some(store) = self.active_store() {
            let request = BucketRequest {
                key: &self.store_key,
                capacity: self.capacity(),
                refill_per_sec: self.capacity() / 60.0,
                cost,
                now_secs: unix_now_secs(),
                ttl: self.key_ttl,
            };
            match store.take_tokens(&request).await {
                Ok(granted) => return granted,
                Err(err) => self.downgrade(&err.to_string()),
            }
        }

        self.bucket.lock().try_take_at(cost, Instant::now())
    }

    /// Poll [`acquire`](Self::acquire) until it succeeds or `max_wait`
    /// elapses. Dropping the future abandons the wait.
    pub async fn wait_for_token(
        &self,
        cost: u32,
        max_wait: Duration,
    ) -> Result<(), RateLimitError> {
        let started = Instant::now();
        loop {
            if self.acquire(cost).await {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(RateLimitError::Timeout {
                    name: self.name.clone(),
                    waited,
                });
            }
            sleep(self.poll_interval.min(max_wait - waited)).await;
        }
    }

    fn active_store(&self) -> Option<&Arc<dyn SharedBucketStore>> {
        if self.degraded.load(Ordering::Acquire) {
            return None;
        }
        self.store.as_ref()
    }

    fn downgrade(&self, reason: &str) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return;
        }
        log::warn!(
            "rate limiter `{}` shared store failed ({reason}); using in-memory bucket from now on",
            self.name
        );
        self.events
            .read()
            .dispatch(FetchEvent::degraded(format!("rate_limiter:{}", self.name), reason));
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("backend", &self.backend())
            .finish()
    }
}

fn unix_now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

/// Named limiters built once at start-up and shared by handle.
#[derive(Debug, Default, Clone)]
pub struct RateLimiterRegistry {
    limiters: HashMap<String, Arc<RateLimiter>>,
    default_max_wait: Duration,
}

impl RateLimiterRegistry {
    /// In-process limiters for every configured class.
    pub fn in_memory(config: &RateLimitConfig) -> Self {
        Self::build(config, |name, rpm| {
            RateLimiter::in_memory(name, rpm)
                .with_key_prefix(&config.key_prefix)
                .with_key_ttl(Duration::from_secs(config.key_ttl_secs))
                .with_poll_interval(config.poll_interval())
        })
    }

    /// Limiters sharing `store`; each one pings it and degrades on its own.
    pub async fn with_store(config: &RateLimitConfig, store: Arc<dyn SharedBucketStore>) -> Self {
        let mut registry = Self {
            limiters: HashMap::new(),
            default_max_wait: config.default_max_wait(),
        };
        for (name, rpm) in &config.classes {
            let limiter = RateLimiter::with_store(name.clone(), *rpm, store.clone())
                .await
                .with_key_prefix(&config.key_prefix)
                .with_key_ttl(Duration::from_secs(config.key_ttl_secs))
                .with_poll_interval(config.poll_interval());
            registry.insert(limiter);
        }
        registry
    }

    /// Connect to the configured Redis store, falling back to in-process
    /// limiters when none is configured or the connection fails.
    #[cfg(feature = "redis")]
    pub async fn connect(config: &RateLimitConfig) -> Self {
        use crate::external_deps::store::RedisBucketStore;

        let Some(url) = config.redis_url() else {
            return Self::in_memory(config);
        };
        match RedisBucketStore::connect(&url).await {
            Ok(store) => Self::with_store(config, Arc::new(store)).await,
            Err(err) => {
                log::warn!("redis unavailable for rate limiting: {err}; using in-memory limiters");
                Self::in_memory(config)
            }
        }
    }

    fn build(config: &RateLimitConfig, make: impl Fn(String, f64) -> RateLimiter) -> Self {
        let mut registry = Self {
            limiters: HashMap::new(),
            default_max_wait: config.default_max_wait(),
        };
        for (name, rpm) in &config.classes {
            registry.insert(make(name.clone(), *rpm));
        }
        registry
    }

    pub fn insert(&mut self, limiter: RateLimiter) -> Arc<RateLimiter> {
        let limiter = Arc::new(limiter);
        self.limiters
            .insert(limiter.name().to_string(), limiter.clone());
        limiter
    }

    /// Hand `events` to every registered limiter.
    pub fn set_events(&self, events: &EventDispatcher) {
        for limiter in self.limiters.values() {
            limiter.set_events(events.clone());
        }
    }

    pub fn limiter(&self, class: &str) -> Result<Arc<RateLimiter>, RateLimitError> {
        self.limiters
            .get(class)
            .cloned()
            .ok_or_else(|| RateLimitError::UnknownClass(class.to_string()))
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    pub fn default_max_wait(&self) -> Duration {
        self.default_max_wait
    }

    pub async fn wait_for_token(
        &self,
        class: &str,
        cost: u32,
        max_wait: Duration,
    ) -> Result<(), RateLimitError> {
        self.limiter(class)?.wait_for_token(cost, max_wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_deps::store::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingStore {
        calls: AtomicUsize,
        fail_ping: bool,
        fail_take: bool,
        grant: bool,
    }

    impl CountingStore {
        fn new(fail_ping: bool, fail_take: bool, grant: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_ping,
                fail_take,
                grant,
            })
        }
    }

    #[async_trait]
    impl SharedBucketStore for CountingStore {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn ping(&self) -> Result<(), StoreError> {
            if self.fail_ping {
                Err(StoreError::Unreachable("refused".into()))
            } else {
                Ok(())
            }
        }

        async fn take_tokens(&self, request: &BucketRequest<'_>) -> Result<bool, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.key, "ratelimit:search");
            assert_eq!(request.ttl, Duration::from_secs(120));
            if self.fail_take {
                Err(StoreError::Command("connection reset".into()))
            } else {
                Ok(self.grant)
            }
        }
    }

    #[test]
    fn grants_never_exceed_capacity_without_time() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(5.0, now);
        let granted = (0..20).filter(|_| bucket.try_take_at(1.0, now)).count();
        assert_eq!(granted, 5);
    }

    #[test]
    fn denial_keeps_partial_refill() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(60.0, start);
        assert!(bucket.try_take_at(60.0, start));
        assert!(!bucket.try_take_at(2.0, start + Duration::from_millis(1500)));
        assert!(bucket.try_take_at(1.0, start + Duration::from_millis(1500)));
        assert!(bucket.available_at(start + Duration::from_millis(1500)) < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refills_lazily_at_capacity_per_minute() {
        let limiter = RateLimiter::in_memory("website", 60.0);
        for _ in 0..60 {
            assert!(limiter.acquire(1).await);
        }
        assert!(!limiter.acquire(1).await);
        tokio::time::advance(Duration::from_secs(30)).await;
        let available = limiter.available();
        assert!((available - 30.0).abs() < 1e-6, "available = {available}");
    }

    #[tokio::test(start_paused = true)]
    async fn two_per_minute_scenario() {
        let limiter = RateLimiter::in_memory("search", 2.0);
        assert!(limiter.acquire(1).await);
        assert!(limiter.acquire(1).await);
        assert!(!limiter.acquire(1).await);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(limiter.acquire(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_token_times_out() {
        let limiter = RateLimiter::in_memory("search", 1.0);
        assert!(limiter.acquire(1).await);

        let started = Instant::now();
        let err = limiter
            .wait_for_token(1, Duration::from_millis(200))
            .await
            .unwrap_err();
        let waited = started.elapsed();
        assert!(matches!(err, RateLimitError::Timeout { .. }));
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_token_succeeds_after_refill() {
        let limiter = RateLimiter::in_memory("search", 60.0);
        assert!(limiter.acquire(60).await);
        tokio_test::assert_ok!(limiter.wait_for_token(1, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn uses_store_when_reachable() {
        let store = CountingStore::new(false, false, false);
        let limiter = RateLimiter::with_store("search", 10.0, store.clone()).await;
        assert_eq!(limiter.backend(), LimiterBackend::Shared("counting"));
        assert!(!limiter.acquire(1).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_store_falls_back_at_start() {
        let store = CountingStore::new(true, false, true);
        let limiter = RateLimiter::with_store("search", 10.0, store.clone()).await;
        assert_eq!(limiter.backend(), LimiterBackend::Memory);
        assert!(limiter.acquire(1).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_error_downgrades_permanently() {
        let store = CountingStore::new(false, true, true);
        let limiter = RateLimiter::with_store("search", 3.0, store.clone()).await;
        assert!(limiter.acquire(1).await);
        assert_eq!(limiter.backend(), LimiterBackend::Memory);
        assert!(limiter.acquire(1).await);
        assert!(limiter.acquire(1).await);
        assert!(!limiter.acquire(1).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct DegradedCounter(AtomicUsize);

    impl crate::modules::events::EventHandler for DegradedCounter {
        fn handle(&self, event: &FetchEvent) {
            if matches!(event, FetchEvent::Degraded(_)) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn registry_forwards_downgrade_to_attached_events() {
        let mut config = RateLimitConfig::default();
        config.classes.retain(|name, _| name == SEARCH_CLASS);
        let store = CountingStore::new(false, true, true);
        let registry = RateLimiterRegistry::with_store(&config, store.clone()).await;
        let counter = Arc::new(DegradedCounter::default());
        let mut events = EventDispatcher::new();
        events.register_handler(counter.clone());
        registry.set_events(&events);

        assert!(registry.limiter(SEARCH_CLASS).unwrap().acquire(1).await);
        assert!(registry.limiter(SEARCH_CLASS).unwrap().acquire(1).await);

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registry_rejects_unknown_class() {
        let registry = RateLimiterRegistry::in_memory(&RateLimitConfig::default());
        assert_eq!(registry.limiter(SEARCH_CLASS).unwrap().capacity(), 100.0);
        assert!(matches!(
            registry
                .wait_for_token("images", 1, Duration::from_millis(10))
                .await,
            Err(RateLimitError::UnknownClass(_))
        ));
    }

    #[test]
    fn builds_redis_url() {
        let mut config = RateLimitConfig::default();
        assert_eq!(config.redis_url(), None);
        config.redis = Some(RedisSettings::default());
        assert_eq!(config.redis_url().unwrap(), "redis://localhost:6379/0");
        config.redis = Some(RedisSettings {
            password: Some("s3cret".into()),
            db: 2,
            ..Default::default()
        });
        assert_eq!(config.redis_url().unwrap(), "redis://:s3cret@localhost:6379/2");
    }
}
