//! Proxy rotation and health tracking.
//!
//! Tracks proxy performance, flips endpoints unhealthy after repeated
//! failures, and selects the next candidate based on the chosen rotation
//! strategy. Endpoints are never removed: an unhealthy endpoint is revived by
//! the next successful use or background probe.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use crate::modules::events::{EventDispatcher, FetchEvent, ProxyHealthEvent};

static IP_PORT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}:\d{2,5}\b").expect("valid ip:port pattern")
});

const DEFAULT_PROBE_URLS: &[&str] = &[
    "https://httpbin.org/ip",
    "https://api.ipify.org?format=json",
    "https://icanhazip.com",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks5 => "socks5",
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyScheme::Socks4 | ProxyScheme::Socks5)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            "socks4" => Some(ProxyScheme::Socks4),
            "socks5" | "socks5h" => Some(ProxyScheme::Socks5),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// Where endpoints come from at initialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProxySource {
    /// Inline endpoint URLs.
    List { endpoints: Vec<String> },
    /// One endpoint per line; blank lines and `#` comments are skipped.
    File {
        path: PathBuf,
        #[serde(default = "default_scheme")]
        default_scheme: ProxyScheme,
    },
    /// Free-form text listing; every `ip:port` pair found is used.
    Remote {
        url: String,
        #[serde(default = "default_scheme")]
        default_scheme: ProxyScheme,
    },
}

impl ProxySource {
    pub fn list<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProxySource::List {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        }
    }

    fn describe(&self) -> String {
        match self {
            ProxySource::List { endpoints } => format!("inline list ({} entries)", endpoints.len()),
            ProxySource::File { path, .. } => path.display().to_string(),
            ProxySource::Remote { url, .. } => url.clone(),
        }
    }
}

fn default_scheme() -> ProxyScheme {
    ProxyScheme::Http
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub enabled: bool,
    pub sources: Vec<ProxySource>,
    pub rotation: RotationStrategy,
    pub failure_threshold: u32,
    pub health_check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub loop_error_cooldown_secs: u64,
    pub max_endpoints: usize,
    pub probe_urls: Vec<String>,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: Vec::new(),
            rotation: RotationStrategy::RoundRobin,
            failure_threshold: 3,
            health_check_interval_secs: 300,
            probe_timeout_secs: 10,
            loop_error_cooldown_secs: 60,
            max_endpoints: 500,
            probe_urls: DEFAULT_PROBE_URLS.iter().map(|url| url.to_string()).collect(),
        }
    }
}

impl ProxyPoolConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn loop_error_cooldown(&self) -> Duration {
        Duration::from_secs(self.loop_error_cooldown_secs)
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error("unsupported proxy scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("proxy source {source_name} failed: {reason}")]
    Source { source_name: String, reason: String },
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("probe timed out after {0:?}")]
    ProbeTimeout(Duration),
}

/// Egress endpoint and its health bookkeeping.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub url: String,
    pub scheme: ProxyScheme,
    pub consecutive_failures: u32,
    pub is_healthy: bool,
    pub successes: u64,
    pub failures: u64,
    pub last_used: Option<Instant>,
    pub last_health_check: Option<Instant>,
    pub latency: Option<Duration>,
}

impl ProxyEndpoint {
    /// Parse `scheme://host:port` or a bare `host:port` (which receives
    /// `default_scheme`).
    pub fn parse(raw: &str, default_scheme: ProxyScheme) -> Result<Self, ProxyError> {
        let raw = raw.trim();
        let (scheme, address) = match raw.split_once("://") {
            Some((scheme, rest)) => (
                ProxyScheme::parse(scheme)
                    .ok_or_else(|| ProxyError::UnsupportedScheme(scheme.to_string()))?,
                rest,
            ),
            None => (default_scheme, raw),
        };

        let host_port = address.rsplit('@').next().unwrap_or(address);
        let valid = host_port
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(ProxyError::InvalidEndpoint(raw.to_string()));
        }

        Ok(Self {
            url: format!("{scheme}://{address}"),
            scheme,
            consecutive_failures: 0,
            is_healthy: true,
            successes: 0,
            failures: 0,
            last_used: None,
            last_health_check: None,
            latency: None,
        })
    }

    /// `success_rate * 50 + max(0, 100 - latency_secs * 10)`; endpoints without
    /// a latency sample get no speed credit.
    pub fn score(&self) -> f64 {
        let total = self.successes + self.failures;
        let success_rate = self.successes as f64 / total.max(1) as f64;
        let speed = self
            .latency
            .map(|rt| (100.0 - rt.as_secs_f64() * 10.0).max(0.0))
            .unwrap_or(0.0);
        success_rate * 50.0 + speed
    }

    fn record_latency(&mut self, sample: Duration) {
        self.latency = Some(match self.latency {
            Some(previous) => previous.mul_f64(0.7) + sample.mul_f64(0.3),
            None => sample,
        });
    }

    /// Returns true when the endpoint flipped back to healthy.
    fn mark_success(&mut self, latency: Option<Duration>) -> bool {
        let revived = !self.is_healthy;
        self.successes += 1;
        self.consecutive_failures = 0;
        self.is_healthy = true;
        if let Some(latency) = latency {
            self.record_latency(latency);
        }
        revived
    }

    /// Returns true when the endpoint just became unhealthy.
    fn mark_failure(&mut self, threshold: u32) -> bool {
        self.failures += 1;
        self.consecutive_failures += 1;
        if self.is_healthy && self.consecutive_failures >= threshold {
            self.is_healthy = false;
            return true;
        }
        false
    }
}

/// Read-only view of one endpoint for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSummary {
    pub url: String,
    pub scheme: ProxyScheme,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub successes: u64,
    pub failures: u64,
    pub latency_ms: Option<f64>,
    pub score: f64,
    pub secs_since_used: Option<f64>,
    pub secs_since_check: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyPoolStats {
    pub enabled: bool,
    pub total: usize,
    pub healthy: usize,
    /// Sorted best score first.
    pub endpoints: Vec<EndpointSummary>,
}

/// Outcome of one health-check sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheckSummary {
    pub checked: usize,
    pub passed: usize,
}

/// Issues a lightweight request through a proxy.
#[async_trait]
pub trait ProxyProber: Send + Sync {
    async fn probe(
        &self,
        proxy_url: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<(), ProxyError>;
}

/// Probes through a throwaway reqwest client bound to the proxy.
#[derive(Debug, Default, Clone)]
pub struct ReqwestProber;

#[async_trait]
impl ProxyProber for ReqwestProber {
    async fn probe(
        &self,
        proxy_url: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<(), ProxyError> {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| ProxyError::InvalidEndpoint(format!("{proxy_url}: {err}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .proxy(proxy)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| ProxyError::Probe(err.to_string()))?;

        let response = client
            .get(target)
            .send()
            .await
            .map_err(|err| ProxyError::Probe(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProxyError::Probe(format!("status {}", response.status())))
        }
    }
}

/// Shared pool of egress endpoints.
pub struct ProxyPool {
    config: ProxyPoolConfig,
    endpoints: RwLock<Vec<ProxyEndpoint>>,
    cursor: AtomicUsize,
    initialized: AtomicBool,
    active: AtomicBool,
    prober: Arc<dyn ProxyProber>,
    events: EventDispatcher,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self::with_prober(config, Arc::new(ReqwestProber))
    }

    pub fn with_prober(config: ProxyPoolConfig, prober: Arc<dyn ProxyProber>) -> Self {
        Self {
            config,
            endpoints: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            active: AtomicBool::new(false),
            prober,
            events: EventDispatcher::new(),
            health_task: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    /// Load endpoints once. Later calls are no-ops. An empty result leaves the
    /// pool in pass-through mode for good; otherwise the background health
    /// loop starts.
    pub async fn initialize(self: &Arc<Self>, sources: &[ProxySource]) -> usize {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.endpoints.read().len();
        }

        if !self.config.enabled {
            log::info!("proxy pool disabled, running in pass-through mode");
            return 0;
        }

        let mut loaded = Vec::new();
        for source in sources {
            match load_source(source, self.config.max_endpoints).await {
                Ok(endpoints) => {
                    log::debug!("loaded {} proxies from {}", endpoints.len(), source.describe());
                    loaded.extend(endpoints);
                }
                Err(err) => log::warn!("skipping proxy source: {err}"),
            }
        }

        let total = {
            let mut guard = self.endpoints.write();
            for endpoint in loaded {
                if guard.len() >= self.config.max_endpoints {
                    break;
                }
                if !guard.iter().any(|existing| existing.url == endpoint.url) {
                    guard.push(endpoint);
                }
            }
            guard.len()
        };

        if total == 0 {
            log::info!("no proxies configured, running in pass-through mode");
            return 0;
        }

        self.active.store(true, Ordering::Release);
        self.spawn_health_loop();
        log::info!("proxy pool initialised with {total} endpoints");
        total
    }

    /// Whether `acquire` can ever hand out an endpoint.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Add an endpoint at runtime. Duplicates are ignored.
    pub fn add_endpoint(&self, raw: &str) -> Result<bool, ProxyError> {
        let endpoint = ProxyEndpoint::parse(raw, ProxyScheme::Http)?;
        let mut guard = self.endpoints.write();
        if guard.iter().any(|existing| existing.url == endpoint.url) {
            return Ok(false);
        }
        guard.push(endpoint);
        Ok(true)
    }

    /// Next healthy endpoint, or `None` when proxying is off or every
    /// endpoint is unhealthy.
    pub fn acquire(&self) -> Option<ProxyEndpoint> {
        if !self.is_active() {
            return None;
        }

        let mut guard = self.endpoints.write();
        let healthy: Vec<usize> = guard
            .iter()
            .enumerate()
            .filter(|(_, endpoint)| endpoint.is_healthy)
            .map(|(idx, _)| idx)
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let selected = match self.config.rotation {
            RotationStrategy::RoundRobin => {
                let position = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[position]
            }
            RotationStrategy::Random => *healthy.choose(&mut rand::thread_rng())?,
        };

        let endpoint = &mut guard[selected];
        endpoint.last_used = Some(Instant::now());
        Some(endpoint.clone())
    }

    pub fn report_success(&self, url: &str) {
        self.report_success_with_latency(url, None);
    }

    pub fn report_success_with_latency(&self, url: &str, latency: Option<Duration>) {
        let revived = {
            let mut guard = self.endpoints.write();
            guard
                .iter_mut()
                .find(|endpoint| endpoint.url == url)
                .map(|endpoint| endpoint.mark_success(latency))
        };
        if revived == Some(true) {
            self.emit_health(url, true, 0);
        }
    }

    pub fn report_failure(&self, url: &str) {
        let threshold = self.config.failure_threshold.max(1);
        let flipped = {
            let mut guard = self.endpoints.write();
            guard
                .iter_mut()
                .find(|endpoint| endpoint.url == url)
                .map(|endpoint| (endpoint.mark_failure(threshold), endpoint.consecutive_failures))
        };
        if let Some((true, failures)) = flipped {
            self.emit_health(url, false, failures);
        }
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let now = Instant::now();
        let guard = self.endpoints.read();
        let mut endpoints: Vec<EndpointSummary> = guard
            .iter()
            .map(|endpoint| EndpointSummary {
                url: endpoint.url.clone(),
                scheme: endpoint.scheme,
                healthy: endpoint.is_healthy,
                consecutive_failures: endpoint.consecutive_failures,
                successes: endpoint.successes,
                failures: endpoint.failures,
                latency_ms: endpoint.latency.map(|rt| rt.as_secs_f64() * 1000.0),
                score: endpoint.score(),
                secs_since_used: endpoint
                    .last_used
                    .map(|ts| now.duration_since(ts).as_secs_f64()),
                secs_since_check: endpoint
                    .last_health_check
                    .map(|ts| now.duration_since(ts).as_secs_f64()),
            })
            .collect();
        endpoints.sort_by(|a, b| b.score.total_cmp(&a.score));

        ProxyPoolStats {
            enabled: self.is_active(),
            total: guard.len(),
            healthy: guard.iter().filter(|endpoint| endpoint.is_healthy).count(),
            endpoints,
        }
    }

    /// Probe every endpoint concurrently, healthy or not, each bounded by the
    /// probe timeout, then commit all outcomes in one critical section.
    pub async fn check_all(&self) -> HealthCheckSummary {
        let targets: Vec<String> = self
            .endpoints
            .read()
            .iter()
            .map(|endpoint| endpoint.url.clone())
            .collect();
        if targets.is_empty() {
            return HealthCheckSummary::default();
        }

        let probe_timeout = self.config.probe_timeout();
        let probes = targets.into_iter().map(|url| {
            let prober = self.prober.clone();
            let target = self.pick_probe_url();
            async move {
                let started = Instant::now();
                let probe = prober.probe(&url, &target, probe_timeout);
                let outcome = match timeout(probe_timeout, probe).await {
                    Ok(Ok(())) => Ok(started.elapsed()),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(ProxyError::ProbeTimeout(probe_timeout)),
                };
                (url, outcome)
            }
        });
        let results = future::join_all(probes).await;

        let threshold = self.config.failure_threshold.max(1);
        let now = Instant::now();
        let mut summary = HealthCheckSummary {
            checked: results.len(),
            passed: 0,
        };
        let mut transitions = Vec::new();
        {
            let mut guard = self.endpoints.write();
            for (url, outcome) in results {
                let Some(endpoint) = guard.iter_mut().find(|endpoint| endpoint.url == url) else {
                    continue;
                };
                endpoint.last_health_check = Some(now);
                match outcome {
                    Ok(latency) => {
                        summary.passed += 1;
                        if endpoint.mark_success(Some(latency)) {
                            transitions.push((url, true, 0));
                        }
                    }
                    Err(err) => {
                        log::debug!("proxy probe failed for {url}: {err}");
                        if endpoint.mark_failure(threshold) {
                            transitions.push((url, false, endpoint.consecutive_failures));
                        }
                    }
                }
            }
        }

        for (url, healthy, failures) in transitions {
            self.emit_health(&url, healthy, failures);
        }
        log::info!(
            "proxy health check: {}/{} endpoints passed",
            summary.passed,
            summary.checked
        );
        summary
    }

    /// Stop the background health loop.
    pub fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
            log::debug!("proxy health loop stopped");
        }
    }

    fn pick_probe_url(&self) -> String {
        if self.config.probe_urls.is_empty() {
            return DEFAULT_PROBE_URLS[0].to_string();
        }
        let idx = rand::thread_rng().gen_range(0..self.config.probe_urls.len());
        self.config.probe_urls[idx].clone()
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval();
        let cooldown = self.config.loop_error_cooldown();

        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(strong) = pool.upgrade() else {
                    break;
                };
                let sweep = tokio::spawn(async move {
                    strong.check_all().await;
                });
                if let Err(err) = sweep.await {
                    log::error!("proxy health check iteration failed: {err}");
                    sleep(cooldown).await;
                }
            }
        });

        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn emit_health(&self, url: &str, healthy: bool, consecutive_failures: u32) {
        self.events.dispatch(FetchEvent::ProxyHealth(ProxyHealthEvent {
            endpoint: url.to_string(),
            healthy,
            consecutive_failures,
            timestamp: chrono::Utc::now(),
        }));
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        if let Some(handle) = self.health_task.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.endpoints.read();
        f.debug_struct("ProxyPool")
            .field("active", &self.is_active())
            .field("total", &guard.len())
            .field("rotation", &self.config.rotation)
            .finish()
    }
}

async fn load_source(source: &ProxySource, limit: usize) -> Result<Vec<ProxyEndpoint>, ProxyError> {
    match source {
        ProxySource::List { endpoints } => Ok(parse_lines(
            endpoints.iter().map(String::as_str),
            ProxyScheme::Http,
            limit,
        )),
        ProxySource::File {
            path,
            default_scheme,
        } => {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|err| ProxyError::Source {
                    source_name: path.display().to_string(),
                    reason: err.to_string(),
                })?;
            Ok(parse_lines(text.lines(), *default_scheme, limit))
        }
        ProxySource::Remote {
            url,
            default_scheme,
        } => {
            let failed = |reason: String| ProxyError::Source {
                source_name: url.clone(),
                reason,
            };
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .map_err(|err| failed(err.to_string()))?;
            let response = client
                .get(url)
                .send()
                .await
                .map_err(|err| failed(err.to_string()))?;
            if !response.status().is_success() {
                return Err(failed(format!("status {}", response.status())));
            }
            let text = response.text().await.map_err(|err| failed(err.to_string()))?;
            Ok(extract_ip_ports(&text, *default_scheme, limit))
        }
    }
}

fn parse_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
    default_scheme: ProxyScheme,
    limit: usize,
) -> Vec<ProxyEndpoint> {
    lines
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match ProxyEndpoint::parse(line, default_scheme) {
            Ok(endpoint) => Some(endpoint),
            Err(err) => {
                log::debug!("ignoring proxy entry: {err}");
                None
            }
        })
        .take(limit)
        .collect()
}

/// Pull every `ip:port` pair out of free-form text.
pub fn extract_ip_ports(text: &str, scheme: ProxyScheme, limit: usize) -> Vec<ProxyEndpoint> {
    IP_PORT_PATTERN
        .find_iter(text)
        .filter_map(|found| ProxyEndpoint::parse(found.as_str(), scheme).ok())
        .take(limit)
        .collect()
}
