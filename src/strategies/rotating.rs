//! Stage 2: retries with a fresh identity, proxy and header variation per attempt.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::{FetchStrategy, StrategyContext, StrategyEnv, StrategyStage};
use crate::config::RetryConfig;
use crate::engine::FetchResult;
use crate::modules::fingerprint::{FingerprintRotator, HeaderVariation};
use crate::transport::HttpTransport;

pub struct RotatingStrategy {
    env: StrategyEnv,
    transport: Arc<dyn HttpTransport>,
    fingerprints: Arc<FingerprintRotator>,
    retry: RetryConfig,
}

impl RotatingStrategy {
    pub fn new(
        env: StrategyEnv,
        transport: Arc<dyn HttpTransport>,
        fingerprints: Arc<FingerprintRotator>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            env,
            transport,
            fingerprints,
            retry,
        }
    }
}

#[async_trait]
impl FetchStrategy for RotatingStrategy {
    fn name(&self) -> &'static str {
        "rotating"
    }

    fn stage(&self) -> StrategyStage {
        StrategyStage::Rotating
    }

    async fn attempt(&self, ctx: &StrategyContext<'_>) -> FetchResult {
        let attempts = ctx.options.max_retries.unwrap_or(self.retry.max_retries);
        let mut last = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.retry.delay_for(attempt - 1);
                debug!("[{}] rotating retry {} after {:?}", ctx.request_id, attempt, delay);
                tokio::time::sleep(delay).await;
            }

            let fingerprint = self.fingerprints.fresh();
            let result = self
                .env
                .transport_attempt(
                    self.transport.as_ref(),
                    ctx,
                    &fingerprint,
                    self.name(),
                    attempt,
                    HeaderVariation::for_retry(attempt),
                )
                .await;
            if result.success {
                return result;
            }
            last = Some(result);
        }

        last.unwrap_or_else(|| {
            FetchResult::failed(
                ctx.request_id,
                ctx.url.as_str(),
                self.name(),
                "no retries configured",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FetchOptions;
    use crate::modules::fingerprint::{FingerprintConfig, FingerprintGenerator};
    use crate::strategies::test_support::*;
    use crate::transport::TransportError;
    use std::time::Duration;
    use tokio::time::Instant;

    fn strategy(transport: Arc<StubTransport>) -> RotatingStrategy {
        RotatingStrategy::new(
            env(),
            transport,
            Arc::new(FingerprintRotator::new(
                FingerprintGenerator::new(),
                &FingerprintConfig::default(),
            )),
            RetryConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_linearly_between_attempts() {
        let transport = Arc::new(StubTransport::new(vec![
            Err(TransportError::Connect("reset".into())),
            Err(TransportError::Connect("reset".into())),
            Ok((200, page_body())),
        ]));
        let strategy = strategy(transport.clone());
        let options = FetchOptions::default().with_max_retries(3);
        let (url, fp) = (url(), fingerprint());
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };
        let started = Instant::now();

        let result = strategy.attempt(&ctx).await;

        assert!(result.success);
        assert_eq!(transport.calls(), 3);
        // 500ms before attempt 2, 1000ms before attempt 3.
        assert_eq!(started.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn varies_headers_per_attempt_and_returns_last_failure() {
        let transport = Arc::new(StubTransport::new(vec![
            Ok((403, page_body())),
            Ok((429, page_body())),
        ]));
        let strategy = strategy(transport.clone());
        let (url, options, fp) = (url(), FetchOptions::default(), fingerprint());
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };

        let result = strategy.attempt(&ctx).await;

        assert!(!result.success);
        assert_eq!(result.status, Some(429));
        assert_eq!(result.strategy, "rotating");
        let requests = transport.requests.lock();
        let cache: Vec<_> = requests
            .iter()
            .map(|r| r.headers.get("cache-control").cloned())
            .collect();
        assert_ne!(cache[0], cache[1]);
        assert!(requests.iter().all(|r| r.headers.contains_key("pragma")));
    }

    #[tokio::test]
    async fn zero_retries_is_a_failure() {
        let transport = Arc::new(StubTransport::new(vec![]));
        let strategy = strategy(transport.clone());
        let options = FetchOptions::default().with_max_retries(0);
        let (url, fp) = (url(), fingerprint());
        let ctx = StrategyContext {
            request_id: "req",
            url: &url,
            options: &options,
            fingerprint: &fp,
        };

        let result = strategy.attempt(&ctx).await;

        assert!(!result.success);
        assert_eq!(transport.calls(), 0);
    }
}
