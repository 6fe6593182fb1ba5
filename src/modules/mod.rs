//! Cross-cutting services shared by every fetch.
//!
//! Proxy pool, rate limiting, fingerprint rotation and the event bus.

pub mod events;
pub mod fingerprint;
pub mod proxy;
pub mod rate_limit;

// Re-export commonly used types
pub use events::{
    AttemptFinishedEvent, AttemptStartedEvent, ChallengeEvent, DegradedEvent, EventDispatcher,
    EventHandler, FetchEvent, LoggingHandler, ProxyHealthEvent,
};
pub use fingerprint::{
    BrowserFingerprint, BrowserType, FingerprintConfig, FingerprintGenerator, FingerprintRotator,
    HeaderVariation,
};
pub use proxy::{
    ProxyEndpoint, ProxyError, ProxyPool, ProxyPoolConfig, ProxyPoolStats, ProxyProber,
    ProxyScheme, ProxySource, RotationStrategy,
};
pub use rate_limit::{
    RateLimitConfig, RateLimitError, RateLimiter, RateLimiterRegistry, SEARCH_CLASS, TokenBucket,
    WEBSITE_CLASS,
};
