//! # resilient-fetch
//!
//! Fetch web pages from sites that rate limit, block or challenge automated
//! clients.
//!
//! Each request walks an escalating cascade of strategies and stops at the
//! first one that yields usable content:
//!
//! 1. `direct`: one plain HTTP request with a browser-like fingerprint.
//! 2. `rotating`: retries with a fresh fingerprint, varied headers, a new
//!    proxy and linear backoff.
//! 3. `browser`: a JS-rendering browser page that can solve interstitials,
//!    reCAPTCHA, image and audio captchas.
//! 4. `blocking_browser`: a synchronous browser binding run on a blocking
//!    worker.
//!
//! Proxy health, token-bucket rate limits (optionally shared through a
//! Redis-compatible store) and fingerprint rotation are handled by the
//! services in [`modules`].
//!
//! ## Example
//!
//! ```no_run
//! use resilient_fetch::{FetchEngine, FetchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = FetchEngine::builder()
//!         .with_proxies(["http://10.0.0.2:3128"])
//!         .build()?;
//!     let result = engine.fetch("https://example.com", FetchOptions::default()).await;
//!     if result.success {
//!         println!("{} via {}", result.text(), result.strategy);
//!     }
//!     Ok(())
//! }
//! ```

pub mod challenges;
pub mod config;
pub mod engine;
pub mod external_deps;
pub mod modules;
pub mod strategies;
pub mod transport;

pub use crate::engine::{
    EXHAUSTED_STRATEGY, EngineError, FetchEngine, FetchEngineBuilder, FetchOptions, FetchResult,
    RATE_LIMITED_STRATEGY,
};

pub use crate::config::{BrowserConfig, ChallengeConfig, ConfigError, EngineConfig, RetryConfig};

pub use crate::challenges::{
    ChallengeDetector, ChallengeInfo, ChallengeKind, ChallengeResolver, ChallengeSolver,
    SolveOutcome, SolverError,
};

pub use crate::strategies::{FetchStrategy, StrategyContext, StrategyEnv, StrategyStage};

pub use crate::transport::{
    HttpTransport, ReqwestTransport, RequestBody, TransportConfig, TransportError,
    TransportRequest, TransportResponse,
};

pub use crate::external_deps::{
    BlockingBrowser, BrowserDriver, BrowserError, BrowserPage, OcrEngine, OcrError,
    SharedBucketStore, SpeechRecognizer,
};

pub use crate::modules::{
    BrowserFingerprint, BrowserType, EventDispatcher, EventHandler, FetchEvent, LoggingHandler,
    ProxyPool, ProxyPoolStats, ProxySource, RateLimitError, RateLimiter, RateLimiterRegistry,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
