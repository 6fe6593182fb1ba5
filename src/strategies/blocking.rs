//! Stage 4: last-resort full browser launch on a blocking worker thread.

use std::sync::Arc;

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::time::{Instant, timeout};

use super::{FetchStrategy, StrategyContext, StrategyEnv, StrategyStage};
use crate::config::BrowserConfig;
use crate::engine::FetchResult;
use crate::external_deps::{BlockingBrowser, BrowserError, LaunchProfile};
use crate::modules::fingerprint::stealth_script;

pub struct BlockingBrowserStrategy {
    env: StrategyEnv,
    browser: Option<Arc<dyn BlockingBrowser>>,
    config: BrowserConfig,
}

impl BlockingBrowserStrategy {
    pub fn new(
        env: StrategyEnv,
        browser: Option<Arc<dyn BlockingBrowser>>,
        config: BrowserConfig,
    ) -> Self {
        Self {
            env,
            browser,
            config,
        }
    }

    fn profile(&self, ctx: &StrategyContext<'_>, proxy: Option<String>) -> LaunchProfile {
        let fingerprint = ctx.fingerprint;
        LaunchProfile {
            user_agent: fingerprint.user_agent.clone(),
            accept_language: fingerprint.accept_language.clone(),
            platform: fingerprint.platform.clone(),
            viewport: fingerprint.viewport,
            headless: self.config.headless,
            page_load_timeout: self.config.page_load_timeout(),
            settle_delay: self.config.settle_delay(),
            init_script: Some(stealth_script(fingerprint)),
            proxy,
        }
    }

    /// Outer bound on one blocking launch: page load plus settle time.
    fn deadline(&self) -> Duration {
        self.config.page_load_timeout() + self.config.settle_delay()
    }
}

#[async_trait]
impl FetchStrategy for BlockingBrowserStrategy {
    fn name(&self) -> &'static str {
        "blocking_browser"
    }

    fn stage(&self) -> StrategyStage {
        StrategyStage::BlockingBrowser
    }

    fn is_available(&self) -> bool {
        self.browser.is_some()
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> FetchResult {
        let Some(browser) = self.browser.clone() else {
            return FetchResult::failed(
                ctx.request_id,
                ctx.url.as_str(),
                self.name(),
                "blocking browser unavailable",
            );
        };

        let proxy = self.env.proxies.acquire().map(|endpoint| endpoint.url);
        let profile = self.profile(ctx, proxy.clone());
        let target = ctx.url.to_string();
        self.env.attempt_started(ctx, self.name(), 1, proxy.as_deref());
        let started = Instant::now();

        let deadline = self.deadline();
        let worker = tokio::task::spawn_blocking(move || browser.fetch(&target, &profile));
        let joined = match timeout(deadline, worker).await {
            Ok(joined) => joined,
            Err(_) => {
                // the worker thread cannot be interrupted; its result is dropped
                warn!("[{}] blocking browser exceeded {:?}", ctx.request_id, deadline);
                Ok(Err(BrowserError::Timeout(deadline)))
            }
        };
        let result = match joined {
            Ok(Ok(snapshot)) => {
                let result = FetchResult::from_page(
                    ctx.request_id,
                    self.name(),
                    snapshot.status.unwrap_or(200),
                    snapshot.url,
                    snapshot.html,
                );
                let size = result.body.len();
                if size < self.config.min_body_bytes {
                    result.with_error(format!(
                        "rendered body too small ({size} < {} bytes)",
                        self.config.min_body_bytes
                    ))
                } else {
                    result
                }
            }
            Ok(Err(err)) => FetchResult::failed(
                ctx.request_id,
                ctx.url.as_str(),
                self.name(),
                err.to_string(),
            ),
            Err(err) => FetchResult::failed(
                ctx.request_id,
                ctx.url.as_str(),
                self.name(),
                format!("browser worker failed: {err}"),
            ),
        };

        let latency = started.elapsed();
        self.env.report_proxy(proxy.as_deref(), result.success, latency);
        self.env.attempt_finished(ctx, 1, &result, latency);
        result
    }
}
