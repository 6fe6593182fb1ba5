//! Stage 3: isolated browser context driven through a [`BrowserDriver`].
//!
//! The context gets the fetch identity (user agent, viewport, locale,
//! timezone) plus the stealth init script. Challenges found on the rendered
//! page are handed to the resolver together with the live page. The context
//! is closed whatever the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::time::Instant;

use super::{FetchStrategy, StrategyContext, StrategyEnv, StrategyStage};
use crate::challenges::{ChallengeInfo, ChallengeKind, SolveOutcome};
use crate::config::BrowserConfig;
use crate::engine::FetchResult;
use crate::external_deps::{BrowserDriver, BrowserError, BrowserPage, ContextOptions, Geolocation};
use crate::modules::fingerprint::{browser_context_headers, stealth_script};

pub struct BrowserStrategy {
    env: StrategyEnv,
    driver: Option<Arc<dyn BrowserDriver>>,
    config: BrowserConfig,
}

impl BrowserStrategy {
    pub fn new(
        env: StrategyEnv,
        driver: Option<Arc<dyn BrowserDriver>>,
        config: BrowserConfig,
    ) -> Self {
        Self { env, driver, config }
    }

    fn context_options(&self, ctx: &StrategyContext<'_>, proxy: Option<String>) -> ContextOptions {
        let fingerprint = ctx.fingerprint;
        ContextOptions {
            user_agent: fingerprint.user_agent.clone(),
            viewport: fingerprint.viewport,
            locale: fingerprint.locale(),
            timezone: fingerprint.timezone.clone(),
            geolocation: self
                .config
                .geolocation
                .map(|(latitude, longitude)| Geolocation { latitude, longitude }),
            extra_headers: browser_context_headers(fingerprint),
            init_script: Some(stealth_script(fingerprint)),
            proxy,
            read_timeout: self.config.page_load_timeout(),
        }
    }

    async fn drive(
        &self,
        page: &dyn BrowserPage,
        ctx: &StrategyContext<'_>,
    ) -> Result<FetchResult, BrowserError> {
        let url = ctx.url.as_str();

        let status = match page.navigate(url, self.config.page_load_timeout()).await {
            Ok(status) => status,
            Err(err) => {
                debug!("[{}] navigation to {} incomplete: {}", ctx.request_id, url, err);
                None
            }
        };
        if let Err(err) = page
            .wait_for_network_idle(self.config.network_idle_timeout())
            .await
        {
            debug!("[{}] network idle wait ended: {}", ctx.request_id, err);
        }

        let mut content = page.content().await?;
        if let Some(info) = self.blocking_challenge(url, &content) {
            debug!("[{}] {} challenge on rendered page", ctx.request_id, info.kind);
            let outcome = self
                .env
                .resolver
                .resolve(&info, url, &content, Some(page))
                .await;
            if let SolveOutcome::Unsolved { reason } = outcome {
                return Ok(self
                    .snapshot(ctx, page, status, content)
                    .await
                    .with_error(format!("{} challenge unsolved: {reason}", info.kind)));
            }
            tokio::time::sleep(self.config.post_challenge_wait()).await;
            content = page.content().await?;
        }

        let result = self.snapshot(ctx, page, status, content).await;
        let size = result.body.len();
        if size < self.config.min_body_bytes {
            return Ok(result.with_error(format!(
                "rendered body too small ({size} < {} bytes)",
                self.config.min_body_bytes
            )));
        }
        Ok(result)
    }

    /// A detected challenge that gates the content. Full-size pages that
    /// merely embed a captcha widget are kept as they are.
    fn blocking_challenge(&self, url: &str, content: &str) -> Option<ChallengeInfo> {
        let info = self.env.resolver.detect(url, content)?;
        let gated = info.kind == ChallengeKind::Interstitial
            || self.env.resolver.is_suspicious(content.len());
        if gated {
            Some(info)
        } else {
            debug!("{} markers on a full-size page at {}, keeping content", info.kind, url);
            None
        }
    }

    async fn snapshot(
        &self,
        ctx: &StrategyContext<'_>,
        page: &dyn BrowserPage,
        status: Option<u16>,
        content: String,
    ) -> FetchResult {
        let final_url = page
            .current_url()
            .await
            .unwrap_or_else(|_| ctx.url.to_string());
        FetchResult::from_page(
            ctx.request_id,
            self.name(),
            status.unwrap_or(200),
            final_url,
            content,
        )
    }
}

#[async_trait]
impl FetchStrategy for BrowserStrategy {
    fn name(&self) -> &'static str {
        "browser"
    }

    fn stage(&self) -> StrategyStage {
        StrategyStage::Browser
    }

    fn is_available(&self) -> bool {
        self.driver.is_some() && self.config.enable_js_rendering
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> FetchResult {
        let Some(driver) = self.driver.as_ref().filter(|_| self.config.enable_js_rendering) else {
            return FetchResult::failed(
                ctx.request_id,
                ctx.url.as_str(),
                self.name(),
                "browser rendering unavailable",
            );
        };

        let proxy = self.env.proxies.acquire().map(|endpoint| endpoint.url);
        self.env.attempt_started(ctx, self.name(), 1, proxy.as_deref());
        let started = Instant::now();

        let result = match driver.new_context(&self.context_options(ctx, proxy.clone())).await {
            Ok(page) => {
                let outcome = self.drive(page.as_ref(), ctx).await;
                if let Err(err) = page.close().await {
                    debug!("[{}] closing browser context failed: {}", ctx.request_id, err);
                }
                outcome.unwrap_or_else(|err| {
                    FetchResult::failed(
                        ctx.request_id,
                        ctx.url.as_str(),
                        self.name(),
                        err.to_string(),
                    )
                })
            }
            Err(err) => FetchResult::failed(
                ctx.request_id,
                ctx.url.as_str(),
                self.name(),
                format!("{} context: {err}", driver.name()),
            ),
        };

        let latency = started.elapsed();
        self.env.report_proxy(proxy.as_deref(), result.success, latency);
        self.env.attempt_finished(ctx, 1, &result, latency);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FetchOptions;
    use crate::strategies::test_support::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Driver handing out pages that serve a fixed sequence of contents.
    struct StubDriver {
        contents: Vec<String>,
        fail_content: bool,
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        options: Mutex<Vec<ContextOptions>>,
    }

    impl StubDriver {
        fn new(contents: &[&str]) -> Self {
            Self {
                contents: contents.iter().map(|c| c.to_string()).collect(),
                fail_content: false,
                opened: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                options: Mutex::new(Vec::new()),
            }
        }
    }

    struct StubPage {
        contents: Mutex<Vec<String>>,
        fail_content: bool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserDriver for StubDriver {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn new_context(
            &self,
            options: &ContextOptions,
        ) -> Result<Box<dyn BrowserPage>, BrowserError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.options.lock().push(options.clone());
            Ok(Box::new(StubPage {
                contents: Mutex::new(self.contents.clone()),
                fail_content: self.fail_content,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    #[async_trait]
    impl BrowserPage for StubPage {
        async fn navigate(
            &self,
            _url: &str,
            timeout: Duration,
        ) -> Result<Option<u16>, BrowserError> {
            Err(BrowserError::Timeout(timeout))
        }

        async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), BrowserError> {
            Err(BrowserError::Timeout(timeout))
        }

        async fn content(&self) -> Result<String, BrowserError> {
            if self.fail_content {
                return Err(BrowserError::Closed);
            }
            let mut contents = self.contents.lock();
            Ok(if contents.len() > 1 {
                contents.remove(0)
            } else {
                contents.first().cloned().unwrap_or_default()
            })
        }

        async fn current_url(&self) -> Result<String, BrowserError> {
            Ok("https://shop.example.com/items?landed=1".into())
        }

        async fn exists(&self, _selector: &str) -> Result<bool, BrowserError> {
            Ok(false)
        }

        async fn click(&self, _selector: &str) -> Result<bool, BrowserError> {
            Ok(false)
        }

        async fn fill(&self, _selector: &str, _text: &str) -> Result<bool, BrowserError> {
            Ok(false)
        }

        async fn attribute(
            &self,
            _selector: &str,
            _name: &str,
        ) -> Result<Option<String>, BrowserError> {
            Ok(None)
        }

        async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, BrowserError> {
            Ok(serde_json::Value::Null)
        }

        async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>, BrowserError> {
            Ok(Vec::new())
        }

        async fn close(self: Box<Self>) -> Result<(), BrowserError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ctx_parts() -> (url::Url, FetchOptions, crate::modules::fingerprint::BrowserFingerprint) {
        (url(), FetchOptions::default(), fingerprint())
    }

    #[tokio::test]
    async fn small_body_is_failure_and_page_is_closed() {
        let driver = Arc::new(StubDriver::new(&["<html><body>denied</body></html>"]));
        let strategy = BrowserStrategy::new(env(), Some(driver.clone()), BrowserConfig::default());
        let (url, options, fp) = ctx_parts();
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };

        let result = strategy.attempt(&ctx).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("too small"));
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rendered_page_succeeds_despite_navigation_timeouts() {
        let body = page_body();
        let driver = Arc::new(StubDriver::new(&[&body]));
        let strategy = BrowserStrategy::new(env(), Some(driver.clone()), BrowserConfig::default());
        let (url, options, fp) = ctx_parts();
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };

        let result = strategy.attempt(&ctx).await;

        assert!(result.success);
        assert_eq!(result.status, Some(200));
        assert_eq!(result.final_url, "https://shop.example.com/items?landed=1");
        let options = driver.options.lock();
        assert_eq!(options[0].user_agent, fp.user_agent);
        assert!(options[0].init_script.as_deref().unwrap().contains("webdriver"));
        assert_eq!(options[0].read_timeout, BrowserConfig::default().page_load_timeout());
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_out_interstitial_before_reading() {
        let wall = "<title>Just a moment...</title><div id=\"cf-browser-verification\"></div>";
        let body = page_body();
        let driver = Arc::new(StubDriver::new(&[wall, wall, &body]));
        let strategy = BrowserStrategy::new(env(), Some(driver.clone()), BrowserConfig::default());
        let (url, options, fp) = ctx_parts();
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };

        let result = strategy.attempt(&ctx).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.body.len(), body.len());
    }

    #[tokio::test]
    async fn full_page_embedding_recaptcha_is_kept() {
        let body = format!(
            "{}<script src=\"https://www.google.com/recaptcha/api.js\"></script>",
            page_body()
        );
        let driver = Arc::new(StubDriver::new(&[&body]));
        let strategy = BrowserStrategy::new(env(), Some(driver.clone()), BrowserConfig::default());
        let (url, options, fp) = ctx_parts();
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };

        let result = strategy.attempt(&ctx).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.body.len(), body.len());
    }

    #[tokio::test(start_paused = true)]
    async fn small_recaptcha_gate_is_resolved_and_fails_when_unsolved() {
        let gate = format!(
            "<html><body>{}<div class=\"g-recaptcha\" data-sitekey=\"6Lc-key\"></div></body></html>",
            "please confirm ".repeat(80)
        );
        let driver = Arc::new(StubDriver::new(&[&gate]));
        let strategy = BrowserStrategy::new(env(), Some(driver.clone()), BrowserConfig::default());
        let (url, options, fp) = ctx_parts();
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };

        let result = strategy.attempt(&ctx).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("recaptcha_v2 challenge unsolved"));
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn content_errors_still_close_the_page() {
        let mut driver = StubDriver::new(&[]);
        driver.fail_content = true;
        let driver = Arc::new(driver);
        let strategy = BrowserStrategy::new(env(), Some(driver.clone()), BrowserConfig::default());
        let (url, options, fp) = ctx_parts();
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };

        let result = strategy.attempt(&ctx).await;

        assert!(!result.success);
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_without_driver_or_rendering() {
        assert!(!BrowserStrategy::new(env(), None, BrowserConfig::default()).is_available());
        let config = BrowserConfig {
            enable_js_rendering: false,
            ..BrowserConfig::default()
        };
        let driver: Arc<dyn BrowserDriver> = Arc::new(StubDriver::new(&[]));
        assert!(!BrowserStrategy::new(env(), Some(driver), config).is_available());
    }
}
