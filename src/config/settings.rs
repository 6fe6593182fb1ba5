use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::fingerprint::FingerprintConfig;
use crate::modules::proxy::ProxyPoolConfig;
use crate::modules::rate_limit::RateLimitConfig;
use crate::transport::TransportConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Stage-2 retry schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Delay before attempt `n` is `base_delay_ms * n`.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub enable_js_rendering: bool,
    pub headless: bool,
    pub page_load_timeout_secs: u64,
    pub network_idle_timeout_secs: u64,
    /// Pause after navigation in the blocking browser.
    pub settle_delay_ms: u64,
    /// Bodies shorter than this count as denied content.
    pub min_body_bytes: usize,
    pub post_challenge_wait_ms: u64,
    pub geolocation: Option<(f64, f64)>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enable_js_rendering: true,
            headless: true,
            page_load_timeout_secs: 15,
            network_idle_timeout_secs: 5,
            settle_delay_ms: 2_000,
            min_body_bytes: 1_000,
            post_challenge_wait_ms: 3_000,
            geolocation: Some((40.7128, -74.0060)),
        }
    }
}

impl BrowserConfig {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn network_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.network_idle_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn post_challenge_wait(&self) -> Duration {
        Duration::from_millis(self.post_challenge_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Transport bodies shorter than this are scanned for challenges.
    pub suspicion_threshold_bytes: usize,
    pub interstitial_polls: u32,
    pub interstitial_poll_interval_ms: u64,
    /// Shortest OCR reading accepted as an answer.
    pub min_solution_len: usize,
    pub recaptcha_settle_ms: u64,
    pub media_timeout_secs: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold_bytes: 5_000,
            interstitial_polls: 30,
            interstitial_poll_interval_ms: 1_000,
            min_solution_len: 4,
            recaptcha_settle_ms: 3_000,
            media_timeout_secs: 10,
        }
    }
}

impl ChallengeConfig {
    pub fn interstitial_poll_interval(&self) -> Duration {
        Duration::from_millis(self.interstitial_poll_interval_ms)
    }

    pub fn recaptcha_settle(&self) -> Duration {
        Duration::from_millis(self.recaptcha_settle_ms)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.media_timeout_secs)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub request_timeout_secs: u64,
    /// Upper bound on in-flight fetches of one batch.
    pub max_concurrent: usize,
    /// Pause between two strategies of the same fetch.
    pub strategy_delay_ms: u64,
    pub retry: RetryConfig,
    pub browser: BrowserConfig,
    pub challenge: ChallengeConfig,
    pub proxy: ProxyPoolConfig,
    pub rate_limit: RateLimitConfig,
    pub fingerprint: FingerprintConfig,
    pub transport: TransportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 15,
            max_concurrent: 100,
            strategy_delay_ms: 100,
            retry: RetryConfig::default(),
            browser: BrowserConfig::default(),
            challenge: ChallengeConfig::default(),
            proxy: ProxyPoolConfig::default(),
            rate_limit: RateLimitConfig::default(),
            fingerprint: FingerprintConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn strategy_delay(&self) -> Duration {
        Duration::from_millis(self.strategy_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs", "must be greater than zero"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent", "must be greater than zero"));
        }
        if self.proxy.failure_threshold == 0 {
            return Err(invalid("proxy.failure_threshold", "must be greater than zero"));
        }
        if let Some((name, rpm)) = self
            .rate_limit
            .classes
            .iter()
            .find(|(_, rpm)| !rpm.is_finite() || **rpm <= 0.0)
        {
            return Err(ConfigError::Invalid {
                field: "rate_limit.classes",
                reason: format!("class {name} has non-positive rate {rpm}"),
            });
        }
        if self.challenge.interstitial_polls == 0 {
            return Err(invalid("challenge.interstitial_polls", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
