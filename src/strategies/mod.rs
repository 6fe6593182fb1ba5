//! Fetch strategies tried in order by the engine.
//!
//! Every stage implements [`FetchStrategy`] and always returns a
//! [`FetchResult`]; a failed stage carries its error text so the engine can
//! escalate to the next one.

pub mod blocking;
pub mod browser;
pub mod direct;
pub mod rotating;

pub use blocking::BlockingBrowserStrategy;
pub use browser::BrowserStrategy;
pub use direct::DirectStrategy;
pub use rotating::RotatingStrategy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use tokio::time::Instant;
use url::Url;

use crate::challenges::ChallengeResolver;
use crate::engine::{FetchOptions, FetchResult};
use crate::modules::events::{
    AttemptFinishedEvent, AttemptStartedEvent, EventDispatcher, FetchEvent,
};
use crate::modules::fingerprint::{BrowserFingerprint, HeaderVariation, build_headers};
use crate::modules::proxy::ProxyPool;
use crate::transport::{HttpTransport, TransportRequest};

/// Lower-cased phrases that mark a 200 response as a block page.
pub const BLOCK_INDICATORS: &[&str] = &[
    "unusual traffic",
    "sorry/index",
    "automated requests",
    "please verify",
    "access denied",
    "bot detected",
];

/// Transport bodies shorter than this are treated as blocked.
pub const MIN_TRANSPORT_BODY: usize = 100;

/// Position of a strategy in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrategyStage {
    Direct = 1,
    Rotating = 2,
    Browser = 3,
    BlockingBrowser = 4,
}

/// Per-fetch inputs shared by every stage.
#[derive(Debug)]
pub struct StrategyContext<'a> {
    pub request_id: &'a str,
    pub url: &'a Url,
    pub options: &'a FetchOptions,
    /// Identity picked by the engine for this fetch.
    pub fingerprint: &'a BrowserFingerprint,
}

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(&self) -> StrategyStage;

    /// Unavailable strategies are skipped without counting as an attempt.
    fn is_available(&self) -> bool {
        true
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> FetchResult;
}

/// Long-lived services handed to every stage.
#[derive(Clone)]
pub struct StrategyEnv {
    pub proxies: Arc<ProxyPool>,
    pub resolver: Arc<ChallengeResolver>,
    pub events: EventDispatcher,
    pub request_timeout: Duration,
}

impl StrategyEnv {
    pub(crate) fn attempt_started(
        &self,
        ctx: &StrategyContext<'_>,
        strategy: &'static str,
        attempt: u32,
        proxy: Option<&str>,
    ) {
        self.events.dispatch(FetchEvent::AttemptStarted(AttemptStartedEvent {
            request_id: ctx.request_id.to_string(),
            url: ctx.url.to_string(),
            strategy,
            attempt,
            proxy: proxy.map(str::to_string),
            timestamp: Utc::now(),
        }));
    }

    pub(crate) fn attempt_finished(
        &self,
        ctx: &StrategyContext<'_>,
        attempt: u32,
        result: &FetchResult,
        latency: Duration,
    ) {
        self.events.dispatch(FetchEvent::AttemptFinished(AttemptFinishedEvent {
            request_id: ctx.request_id.to_string(),
            url: ctx.url.to_string(),
            strategy: result.strategy,
            attempt,
            success: result.success,
            status: result.status,
            latency,
            error: result.error.clone(),
            timestamp: Utc::now(),
        }));
    }

    /// Report a browser-stage outcome for the proxy it was given.
    pub(crate) fn report_proxy(&self, proxy: Option<&str>, success: bool, latency: Duration) {
        if let Some(proxy) = proxy {
            if success {
                self.proxies.report_success_with_latency(proxy, Some(latency));
            } else {
                self.proxies.report_failure(proxy);
            }
        }
    }

    /// One request through `transport` with a freshly drawn proxy.
    pub(crate) async fn transport_attempt(
        &self,
        transport: &dyn HttpTransport,
        ctx: &StrategyContext<'_>,
        fingerprint: &BrowserFingerprint,
        strategy: &'static str,
        attempt: u32,
        variation: HeaderVariation,
    ) -> FetchResult {
        let proxy = self.proxies.acquire().map(|endpoint| endpoint.url);
        let headers = build_headers(fingerprint, ctx.url.as_str(), variation, &ctx.options.headers);
        let request = TransportRequest {
            method: ctx.options.method.clone(),
            url: ctx.url.clone(),
            headers,
            query: ctx.options.query.clone(),
            body: ctx.options.body.clone(),
            proxy: proxy.clone(),
            timeout: self.request_timeout,
        };

        self.attempt_started(ctx, strategy, attempt, proxy.as_deref());
        let started = Instant::now();
        let result = match transport.execute(request).await {
            Ok(response) => {
                let latency = started.elapsed();
                if let Some(proxy) = proxy.as_deref() {
                    if response.status == 200 {
                        self.proxies.report_success_with_latency(proxy, Some(latency));
                    } else {
                        self.proxies.report_failure(proxy);
                    }
                }
                let verdict = self.assess(ctx, response.status, &response.text());
                let result = FetchResult::from_response(ctx.request_id, strategy, response);
                match verdict {
                    Some(reason) => result.with_error(reason),
                    None => result,
                }
            }
            Err(err) => {
                if let Some(proxy) = proxy.as_deref() {
                    self.proxies.report_failure(proxy);
                }
                FetchResult::failed(ctx.request_id, ctx.url.as_str(), strategy, err.to_string())
            }
        };
        self.attempt_finished(ctx, attempt, &result, started.elapsed());
        result
    }

    /// Reason a transport response does not count as a success.
    fn assess(&self, ctx: &StrategyContext<'_>, status: u16, body: &str) -> Option<String> {
        if status != 200 {
            return Some(format!("unexpected status {status}"));
        }
        if let Some(indicator) = block_indicator(body) {
            return Some(format!("blocked: {indicator}"));
        }
        if self.resolver.is_suspicious(body.len()) {
            if let Some(info) = self.resolver.detect(ctx.url.as_str(), body) {
                debug!("[{}] {} challenge in transport response", ctx.request_id, info.kind);
                self.events.dispatch(FetchEvent::challenge(
                    ctx.url.as_str(),
                    info.kind.name(),
                    false,
                    Some("detected in transport response".to_string()),
                ));
                return Some(format!("challenge detected: {}", info.kind));
            }
        }
        None
    }
}

impl std::fmt::Debug for StrategyEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEnv")
            .field("request_timeout", &self.request_timeout)
            .field("proxy_pool_active", &self.proxies.is_active())
            .finish()
    }
}

/// First block indicator found in `body`, or a marker for implausibly short bodies.
pub fn block_indicator(body: &str) -> Option<&'static str> {
    if body.len() < MIN_TRANSPORT_BODY {
        return Some("body too short");
    }
    let lowered = body.to_lowercase();
    BLOCK_INDICATORS
        .iter()
        .copied()
        .find(|indicator| lowered.contains(indicator))
}
