//! High level fetch orchestration.
//!
//! Wires the proxy pool, rate limiters, fingerprint rotation and challenge
//! resolver into an escalating cascade of fetch strategies. Public entry
//! points never return `Err`: every failure ends up in a [`FetchResult`].

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep};
use url::Url;
use uuid::Uuid;

use crate::challenges::ChallengeResolver;
use crate::config::{ConfigError, EngineConfig};
use crate::external_deps::{BlockingBrowser, BrowserDriver, OcrEngine, SpeechRecognizer};
use crate::modules::events::{EventDispatcher, EventHandler, FetchEvent};
use crate::modules::fingerprint::{FingerprintGenerator, FingerprintRotator};
use crate::modules::proxy::{ProxyPool, ProxyPoolStats, ProxyProber, ProxySource};
use crate::modules::rate_limit::{RateLimitError, RateLimiterRegistry};
use crate::strategies::{
	BlockingBrowserStrategy, BrowserStrategy, DirectStrategy, FetchStrategy, RotatingStrategy,
	StrategyContext, StrategyEnv, StrategyStage,
};
use crate::transport::{HttpTransport, ReqwestTransport, RequestBody, TransportResponse};

/// Strategy label of a fetch that exhausted the cascade.
pub const EXHAUSTED_STRATEGY: &str = "none";
/// Strategy label of a fetch refused by its rate limiter.
pub const RATE_LIMITED_STRATEGY: &str = "rate_limit";

/// Error raised while assembling an engine.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("no fetch strategies configured")]
	NoStrategies,
}

/// Per-call knobs for [`FetchEngine::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
	/// Skip the transport stages and start with the browser.
	pub force_browser: bool,
	/// Skip the direct attempt and start with rotating retries.
	pub force_alternative: bool,
	pub method: Method,
	pub headers: Vec<(String, String)>,
	pub query: Vec<(String, String)>,
	pub body: Option<RequestBody>,
	/// Overrides the configured number of rotating retries.
	pub max_retries: Option<u32>,
	/// Acquire a token from this limiter class before fetching.
	pub rate_limit_class: Option<String>,
	pub max_wait: Option<Duration>,
}

impl FetchOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn force_browser(mut self) -> Self {
		self.force_browser = true;
		self
	}

	pub fn force_alternative(mut self) -> Self {
		self.force_alternative = true;
		self
	}

	pub fn with_method(mut self, method: Method) -> Self {
		self.method = method;
		self
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));
		self
	}

	pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.query.push((name.into(), value.into()));
		self
	}

	pub fn with_body(mut self, body: RequestBody) -> Self {
		self.body = Some(body);
		self
	}

	pub fn with_max_retries(mut self, retries: u32) -> Self {
		self.max_retries = Some(retries);
		self
	}

	pub fn with_rate_limit(mut self, class: impl Into<String>, max_wait: Option<Duration>) -> Self {
		self.rate_limit_class = Some(class.into());
		self.max_wait = max_wait;
		self
	}

	/// Earliest stage this call may use.
	pub fn first_stage(&self) -> StrategyStage {
		if self.force_browser {
			StrategyStage::Browser
		} else if self.force_alternative {
			StrategyStage::Rotating
		} else {
			StrategyStage::Direct
		}
	}
}

/// Normalised outcome of a fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
	pub success: bool,
	pub status: Option<u16>,
	pub body: Bytes,
	pub headers: HeaderMap,
	/// URL after redirects.
	pub final_url: String,
	/// Strategy that produced this result.
	pub strategy: &'static str,
	pub error: Option<String>,
	pub request_id: String,
	pub elapsed: Duration,
}

impl FetchResult {
	/// Failure with no response attached.
	pub fn failed(
		request_id: &str,
		url: &str,
		strategy: &'static str,
		error: impl Into<String>,
	) -> Self {
		Self {
			success: false,
			status: None,
			body: Bytes::new(),
			headers: HeaderMap::new(),
			final_url: url.to_string(),
			strategy,
			error: Some(error.into()),
			request_id: request_id.to_string(),
			elapsed: Duration::ZERO,
		}
	}

	/// Successful result built from a transport response.
	pub fn from_response(
		request_id: &str,
		strategy: &'static str,
		response: TransportResponse,
	) -> Self {
		Self {
			success: true,
			status: Some(response.status),
			body: response.body,
			headers: response.headers,
			final_url: response.url.to_string(),
			strategy,
			error: None,
			request_id: request_id.to_string(),
			elapsed: Duration::ZERO,
		}
	}

	/// Successful result built from rendered page content.
	pub fn from_page(
		request_id: &str,
		strategy: &'static str,
		status: u16,
		final_url: String,
		html: String,
	) -> Self {
		Self {
			success: true,
			status: Some(status),
			body: Bytes::from(html),
			headers: HeaderMap::new(),
			final_url,
			strategy,
			error: None,
			request_id: request_id.to_string(),
			elapsed: Duration::ZERO,
		}
	}

	/// Mark as failed, keeping whatever response data is attached.
	pub fn with_error(mut self, error: impl Into<String>) -> Self {
		self.success = false;
		self.error = Some(error.into());
		self
	}

	pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
		self.elapsed = elapsed;
		self
	}

	/// Body decoded as UTF-8, replacing invalid sequences.
	pub fn text(&self) -> Cow<'_, str> {
		String::from_utf8_lossy(&self.body)
	}
}

/// Builder for [`FetchEngine`].
pub struct FetchEngineBuilder {
	config: EngineConfig,
	transport: Option<Arc<dyn HttpTransport>>,
	browser_driver: Option<Arc<dyn BrowserDriver>>,
	blocking_browser: Option<Arc<dyn BlockingBrowser>>,
	proxy_prober: Option<Arc<dyn ProxyProber>>,
	rate_limiters: Option<RateLimiterRegistry>,
	ocr: Option<Arc<dyn OcrEngine>>,
	speech: Option<Arc<dyn SpeechRecognizer>>,
	fingerprints: FingerprintGenerator,
	strategies: Option<Vec<Arc<dyn FetchStrategy>>>,
	events: EventDispatcher,
}

impl FetchEngineBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			transport: None,
			browser_driver: None,
			blocking_browser: None,
			proxy_prober: None,
			rate_limiters: None,
			ocr: None,
			speech: None,
			fingerprints: FingerprintGenerator::new(),
			strategies: None,
			events: EventDispatcher::with_logging(),
		}
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout_secs = timeout.as_secs().max(1);
		self
	}

	pub fn with_max_retries(mut self, retries: u32) -> Self {
		self.config.retry.max_retries = retries;
		self
	}

	pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.proxy.sources.push(ProxySource::list(proxies));
		self
	}

	pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_browser_driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
		self.browser_driver = Some(driver);
		self
	}

	pub fn with_blocking_browser(mut self, browser: Arc<dyn BlockingBrowser>) -> Self {
		self.blocking_browser = Some(browser);
		self
	}

	pub fn with_proxy_prober(mut self, prober: Arc<dyn ProxyProber>) -> Self {
		self.proxy_prober = Some(prober);
		self
	}

	pub fn with_rate_limiters(mut self, registry: RateLimiterRegistry) -> Self {
		self.rate_limiters = Some(registry);
		self
	}

	pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
		self.ocr = Some(ocr);
		self
	}

	pub fn with_speech(mut self, speech: Arc<dyn SpeechRecognizer>) -> Self {
		self.speech = Some(speech);
		self
	}

	pub fn with_fingerprint_generator(mut self, generator: FingerprintGenerator) -> Self {
		self.fingerprints = generator;
		self
	}

	/// Replace the stock cascade with a custom ordered list.
	pub fn with_strategies(mut self, strategies: Vec<Arc<dyn FetchStrategy>>) -> Self {
		self.strategies = Some(strategies);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.events.register_handler(handler);
		self
	}

	pub fn disable_js_rendering(mut self) -> Self {
		self.config.browser.enable_js_rendering = false;
		self
	}

	pub fn build(self) -> Result<FetchEngine, EngineError> {
		FetchEngine::with_parts(self)
	}
}

impl Default for FetchEngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Resilient fetch orchestrator.
pub struct FetchEngine {
	config: EngineConfig,
	strategies: Vec<Arc<dyn FetchStrategy>>,
	proxies: Arc<ProxyPool>,
	rate_limiters: Arc<RateLimiterRegistry>,
	resolver: Arc<ChallengeResolver>,
	fingerprints: Arc<FingerprintRotator>,
	events: EventDispatcher,
}

impl FetchEngine {
	/// Engine with default configuration and the reqwest transport.
	pub fn new() -> Result<Self, EngineError> {
		FetchEngineBuilder::new().build()
	}

	pub fn builder() -> FetchEngineBuilder {
		FetchEngineBuilder::new()
	}

	fn with_parts(parts: FetchEngineBuilder) -> Result<Self, EngineError> {
		let FetchEngineBuilder {
			config,
			transport,
			browser_driver,
			blocking_browser,
			proxy_prober,
			rate_limiters,
			ocr,
			speech,
			fingerprints,
			strategies,
			events,
		} = parts;
		config.validate()?;

		let transport: Arc<dyn HttpTransport> = transport
			.unwrap_or_else(|| Arc::new(ReqwestTransport::new(config.transport.clone())));

		let proxies = match proxy_prober {
			Some(prober) => ProxyPool::with_prober(config.proxy.clone(), prober),
			None => ProxyPool::new(config.proxy.clone()),
		};
		let proxies = Arc::new(proxies.with_events(events.clone()));

		let mut resolver = ChallengeResolver::new(config.challenge.clone())
			.with_transport(Arc::clone(&transport))
			.with_events(events.clone());
		if let Some(ocr) = ocr {
			resolver = resolver.with_ocr(ocr);
		}
		if let Some(speech) = speech {
			resolver = resolver.with_speech(speech);
		}
		let resolver = Arc::new(resolver);

		let rate_limiters = Arc::new(
			rate_limiters.unwrap_or_else(|| RateLimiterRegistry::in_memory(&config.rate_limit)),
		);
		rate_limiters.set_events(&events);
		let fingerprints = Arc::new(FingerprintRotator::new(
			fingerprints.with_browsers(config.fingerprint.browsers.clone()),
			&config.fingerprint,
		));

		let strategies = match strategies {
			Some(custom) => custom,
			None => {
				if config.browser.enable_js_rendering && browser_driver.is_none() {
					warn!("no browser driver configured; browser stage disabled");
					events.dispatch(FetchEvent::degraded(
						"browser",
						"no browser driver configured",
					));
				}
				let env = StrategyEnv {
					proxies: Arc::clone(&proxies),
					resolver: Arc::clone(&resolver),
					events: events.clone(),
					request_timeout: config.request_timeout(),
				};
				let stock: Vec<Arc<dyn FetchStrategy>> = vec![
					Arc::new(DirectStrategy::new(env.clone(), Arc::clone(&transport))),
					Arc::new(RotatingStrategy::new(
						env.clone(),
						Arc::clone(&transport),
						Arc::clone(&fingerprints),
						config.retry.clone(),
					)),
					Arc::new(BrowserStrategy::new(
						env.clone(),
						browser_driver,
						config.browser.clone(),
					)),
					Arc::new(BlockingBrowserStrategy::new(
						env,
						blocking_browser,
						config.browser.clone(),
					)),
				];
				stock
			}
		};
		if strategies.is_empty() {
			return Err(EngineError::NoStrategies);
		}

		Ok(Self {
			config,
			strategies,
			proxies,
			rate_limiters,
			resolver,
			fingerprints,
			events,
		})
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	/// Load configured proxy sources and start health checks. Runs once;
	/// `fetch` calls it implicitly.
	pub async fn initialize(&self) -> usize {
		self.proxies.initialize(&self.config.proxy.sources).await
	}

	/// GET `url` with default options.
	pub async fn get(&self, url: &str) -> FetchResult {
		self.fetch(url, FetchOptions::default()).await
	}

	/// Run the strategy cascade for `url`.
	pub async fn fetch(&self, url: &str, options: FetchOptions) -> FetchResult {
		let request_id = Uuid::new_v4().to_string();
		let started = Instant::now();

		let target = match Url::parse(url) {
			Ok(target) => target,
			Err(err) => {
				return FetchResult::failed(&request_id, url, EXHAUSTED_STRATEGY, format!("invalid url: {err}"))
					.with_elapsed(started.elapsed());
			}
		};

		self.initialize().await;

		if let Some(class) = options.rate_limit_class.as_deref() {
			let max_wait = options
				.max_wait
				.unwrap_or_else(|| self.rate_limiters.default_max_wait());
			if let Err(err) = self.rate_limiters.wait_for_token(class, 1, max_wait).await {
				debug!("[{request_id}] rate limit refused {url}: {err}");
				return FetchResult::failed(&request_id, url, RATE_LIMITED_STRATEGY, err.to_string())
					.with_elapsed(started.elapsed());
			}
		}

		let fingerprint = self.fingerprints.current();
		let ctx = StrategyContext {
			request_id: &request_id,
			url: &target,
			options: &options,
			fingerprint: &fingerprint,
		};

		let first_stage = options.first_stage();
		let mut last_error: Option<String> = None;
		let mut attempted = false;

		for strategy in self.strategies.iter().filter(|s| s.stage() >= first_stage) {
			if !strategy.is_available() {
				debug!("[{request_id}] skipping unavailable strategy {}", strategy.name());
				continue;
			}
			if attempted {
				sleep(self.config.strategy_delay()).await;
			}
			attempted = true;

			let result = strategy.attempt(&ctx).await;
			if result.success {
				debug!(
					"[{request_id}] {} succeeded for {} in {:.2}s",
					strategy.name(),
					url,
					started.elapsed().as_secs_f64()
				);
				return result.with_elapsed(started.elapsed());
			}

			debug!(
				"[{request_id}] {} failed: {}",
				strategy.name(),
				result.error.as_deref().unwrap_or("unknown error")
			);
			last_error = Some(format!(
				"{}: {}",
				strategy.name(),
				result.error.as_deref().unwrap_or("failed")
			));
		}

		warn!("all fetch strategies failed for {url}");
		FetchResult::failed(
			&request_id,
			url,
			EXHAUSTED_STRATEGY,
			last_error.unwrap_or_else(|| "no fetch strategy available".to_string()),
		)
		.with_elapsed(started.elapsed())
	}

	/// Fetch every URL with at most `max_concurrent` in flight, never more
	/// than the configured `max_concurrent`. Results keep the input order.
	pub async fn fetch_many<I, S>(&self, urls: I, max_concurrent: usize) -> Vec<FetchResult>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		self.fetch_many_with(urls, FetchOptions::default(), max_concurrent)
			.await
	}

	pub async fn fetch_many_with<I, S>(
		&self,
		urls: I,
		options: FetchOptions,
		max_concurrent: usize,
	) -> Vec<FetchResult>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let limit = max_concurrent.clamp(1, self.config.max_concurrent.max(1));
		let gate = Arc::new(Semaphore::new(limit));
		let urls: Vec<String> = urls.into_iter().map(|u| u.as_ref().to_string()).collect();
		info!("fetching {} urls, at most {limit} in flight", urls.len());

		let tasks = urls.iter().map(|url| {
			let gate = Arc::clone(&gate);
			let options = options.clone();
			async move {
				match gate.acquire_owned().await {
					Ok(_permit) => self.fetch(url, options).await,
					Err(err) => FetchResult::failed("", url, EXHAUSTED_STRATEGY, err.to_string()),
				}
			}
		});
		futures::future::join_all(tasks).await
	}

	/// Wait for a token of `class` outside of a fetch.
	pub async fn wait_for_token(
		&self,
		class: &str,
		cost: u32,
		max_wait: Duration,
	) -> Result<(), RateLimitError> {
		self.rate_limiters.wait_for_token(class, cost, max_wait).await
	}

	pub fn rate_limiters(&self) -> &Arc<RateLimiterRegistry> {
		&self.rate_limiters
	}

	pub fn proxies(&self) -> &Arc<ProxyPool> {
		&self.proxies
	}

	pub fn proxy_stats(&self) -> ProxyPoolStats {
		self.proxies.stats()
	}

	pub fn resolver(&self) -> &ChallengeResolver {
		&self.resolver
	}

	pub fn events(&self) -> &EventDispatcher {
		&self.events
	}

	/// Names of the configured strategies in cascade order.
	pub fn strategy_names(&self) -> Vec<&'static str> {
		self.strategies.iter().map(|s| s.name()).collect()
	}

	/// Stop background work (proxy health checks).
	pub fn shutdown(&self) {
		self.proxies.shutdown();
	}
}

impl std::fmt::Debug for FetchEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FetchEngine")
			.field("strategies", &self.strategy_names())
			.field("resolver", &self.resolver)
			.field("fingerprints", &self.fingerprints)
			.finish()
	}
}
